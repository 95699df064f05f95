// crates/server/src/routes/stats.rs
//! Aggregate statistics.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::{envelope, ApiError};
use crate::state::AppState;

/// GET /stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let overview = state.db.stats_overview().await?;
    Ok(envelope(overview, started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/stats", get(stats))
}
