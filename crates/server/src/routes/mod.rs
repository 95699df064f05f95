// crates/server/src/routes/mod.rs
//! API route handlers for the pi-brain server.

pub mod clusters;
pub mod config;
pub mod daemon;
pub mod health;
pub mod insights;
pub mod nodes;
pub mod search;
pub mod sessions;
pub mod stats;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Create the combined API router.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(nodes::router())
        .merge(sessions::router())
        .merge(search::router())
        .merge(stats::router())
        .merge(insights::router())
        .merge(clusters::router())
        .merge(daemon::router())
        .merge(config::router())
        .merge(ws::router())
        .with_state(state)
}
