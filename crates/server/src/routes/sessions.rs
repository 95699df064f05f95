// crates/server/src/routes/sessions.rs
//! Session-centric views: project groups and per-session nodes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{envelope, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGroup {
    pub project: String,
    pub node_count: i64,
}

/// GET /sessions — project groups with node counts.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let groups: Vec<ProjectGroup> = state
        .db
        .project_groups()
        .await?
        .into_iter()
        .map(|(project, node_count)| ProjectGroup {
            project,
            node_count,
        })
        .collect();
    Ok(envelope(groups, started))
}

/// GET /sessions/:id/nodes — nested nodes of one session, oldest first.
pub async fn session_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let nodes = state.db.nodes_for_session(&id).await?;
    if nodes.is_empty() {
        return Err(ApiError::NotFound(format!("session {id}")));
    }
    Ok(envelope(nodes, started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/nodes", get(session_nodes))
}
