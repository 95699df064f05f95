// crates/server/src/routes/health.rs
//! Health check with subsystem status.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::envelope;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub subsystems: Subsystems,
}

/// Degraded subsystems show up here rather than failing the endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subsystems {
    pub database: bool,
    pub embedder: bool,
    pub daemon: bool,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let started = Instant::now();
    let database = state.db.stats_overview().await.is_ok();
    let daemon = state.daemon.read().await.is_some();
    envelope(
        HealthData {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.uptime_secs(),
            subsystems: Subsystems {
                database,
                embedder: state.embedder.is_some(),
                daemon,
            },
        },
        started,
    )
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}
