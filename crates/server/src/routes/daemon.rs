// crates/server/src/routes/daemon.rs
//! Daemon status and queue inspection.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_core::JobState;

/// GET /daemon/status
pub async fn daemon_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let guard = state.daemon.read().await;
    match guard.as_ref() {
        Some(daemon) => {
            let status = daemon.status().await?;
            Ok(envelope(status, started))
        }
        None => Ok(envelope(
            serde_json::json!({ "running": false }),
            started,
        )),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueQuery {
    /// Filter by state (`pending`, `running`, `failed`, ...).
    pub state: Option<String>,
    pub limit: Option<i64>,
}

/// GET /daemon/queue
pub async fn daemon_queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let job_state = match &query.state {
        None => None,
        Some(raw) => Some(
            JobState::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown job state: {raw}")))?,
        ),
    };
    let jobs = state
        .db
        .list_jobs(job_state, query.limit.unwrap_or(50).min(500))
        .await?;
    let depths = state.db.queue_depths().await?;
    Ok(envelope(
        serde_json::json!({ "depths": depths, "jobs": jobs }),
        started,
    ))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/daemon/status", get(daemon_status))
        .route("/daemon/queue", get(daemon_queue))
}
