// crates/server/src/routes/clusters.rs
//! Cluster listing and review status updates.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_core::insight::ClusterStatus;

/// GET /clusters — clusters with their member node ids.
pub async fn list_clusters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let clusters = state.db.list_clusters().await?;
    let mut out = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let members = state.db.cluster_members(&cluster.id).await?;
        let mut value = serde_json::to_value(&cluster)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        value["members"] = serde_json::json!(members);
        out.push(value);
    }
    Ok(envelope(out, started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: String,
}

/// POST /clusters/:id/status — confirm or dismiss.
pub async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let status = ClusterStatus::parse(&update.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", update.status)))?;
    state.db.set_cluster_status(&id, status).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": update.status }), started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/clusters", get(list_clusters))
        .route("/clusters/{id}/status", post(set_status))
}
