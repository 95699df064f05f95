// crates/server/src/lib.rs
//! pi-brain HTTP/WebSocket server.
//!
//! A thin layer over the store's query API and the daemon's control plane:
//! handlers read, the daemon writes. CORS admits localhost plus any origins
//! named in `api.corsOrigins`.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// CORS restricted to localhost plus explicitly configured origins.
///
/// Without this, any website could read the knowledge graph through
/// `fetch()` against the local port.
fn cors_layer(extra_origins: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _req_parts: &axum::http::request::Parts| {
                let Ok(origin) = origin.to_str() else {
                    return false;
                };
                origin.starts_with("http://localhost:")
                    || origin.starts_with("http://127.0.0.1:")
                    || origin == "http://localhost"
                    || origin == "http://127.0.0.1"
                    || extra_origins.iter().any(|allowed| allowed == origin)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the axum application from prepared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    let extra_origins = state
        .config
        .read()
        .expect("config lock")
        .api
        .cors_origins
        .clone();
    Router::new()
        .merge(api_routes(state))
        .layer(cors_layer(extra_origins))
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Integration tests
// ============================================================================
