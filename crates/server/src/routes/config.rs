// crates/server/src/routes/config.rs
//! Config read/update endpoints and spoke CRUD.
//!
//! Updates validate before they apply, mutate the in-memory config, and
//! persist the whole document to disk via atomic rename. The embedding API
//! key is write-only: it never appears in GET responses.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_core::config::{DaemonConfig, SpokeConfig};
use pi_brain_core::Config;

/// The embedding API key is write-only on the HTTP surface: it persists to
/// disk with the rest of the config but never appears in a response.
fn redact_daemon_secrets(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(map) = value.as_object_mut() {
        map.remove("embeddingApiKey");
    }
    value
}

fn persist(state: &AppState, config: &Config) -> Result<(), ApiError> {
    let Some(path) = &state.config_path else {
        return Ok(());
    };
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| ApiError::Internal(format!("serialize config: {e}")))?;
    // Atomic rename keeps a crashed write from truncating the config.
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| ApiError::Internal(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(())
}

/// GET /config/:section
pub async fn get_section(
    State(state): State<Arc<AppState>>,
    Path(section): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let config = state.config.read().expect("config lock").clone();
    let data = match section.as_str() {
        "daemon" => serde_json::to_value(&config.daemon).map(redact_daemon_secrets),
        "query" => serde_json::to_value(&config.query),
        "api" => serde_json::to_value(&config.api),
        "hub" => serde_json::to_value(&config.hub),
        "spokes" => serde_json::to_value(&config.spokes),
        other => return Err(ApiError::NotFound(format!("config section {other}"))),
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(envelope(data, started))
}

/// PUT /config/:section
pub async fn put_section(
    State(state): State<Arc<AppState>>,
    Path(section): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let mut config = state.config.read().expect("config lock").clone();
    match section.as_str() {
        "daemon" => {
            // GET redacts the key, so a read-modify-write PUT arrives
            // without it: an absent field keeps the stored key, an explicit
            // null clears it.
            let supplies_key = body.get("embeddingApiKey").is_some();
            let mut daemon: DaemonConfig = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid daemon config: {e}")))?;
            if !supplies_key {
                daemon.embedding_api_key = config.daemon.embedding_api_key.clone();
            }
            config.daemon = daemon;
        }
        "query" => {
            config.query = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid query config: {e}")))?;
        }
        "api" => {
            config.api = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid api config: {e}")))?;
        }
        "hub" => {
            config.hub = serde_json::from_value(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid hub config: {e}")))?;
        }
        other => return Err(ApiError::NotFound(format!("config section {other}"))),
    }
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    persist(&state, &config)?;
    *state.config.write().expect("config lock") = config.clone();
    get_section(State(state), Path(section)).await.map(|mut response| {
        // Refresh the duration for this request.
        response.0["durationMs"] = serde_json::json!(started.elapsed().as_millis() as u64);
        response
    })
}

/// POST /config/spokes
pub async fn add_spoke(
    State(state): State<Arc<AppState>>,
    Json(spoke): Json<SpokeConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let mut config = state.config.read().expect("config lock").clone();
    if config.spokes.iter().any(|s| s.name == spoke.name) {
        return Err(ApiError::BadRequest(format!(
            "spoke {} already exists",
            spoke.name
        )));
    }
    config.spokes.push(spoke);
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    persist(&state, &config)?;
    let spokes = config.spokes.clone();
    *state.config.write().expect("config lock") = config;
    Ok(envelope(spokes, started))
}

/// PUT /config/spokes/:name
pub async fn update_spoke(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(spoke): Json<SpokeConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let mut config = state.config.read().expect("config lock").clone();
    let slot = config
        .spokes
        .iter_mut()
        .find(|s| s.name == name)
        .ok_or_else(|| ApiError::NotFound(format!("spoke {name}")))?;
    *slot = spoke;
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    persist(&state, &config)?;
    let spokes = config.spokes.clone();
    *state.config.write().expect("config lock") = config;
    Ok(envelope(spokes, started))
}

/// DELETE /config/spokes/:name
pub async fn delete_spoke(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let mut config = state.config.read().expect("config lock").clone();
    let before = config.spokes.len();
    config.spokes.retain(|s| s.name != name);
    if config.spokes.len() == before {
        return Err(ApiError::NotFound(format!("spoke {name}")));
    }
    persist(&state, &config)?;
    let spokes = config.spokes.clone();
    *state.config.write().expect("config lock") = config;
    Ok(envelope(spokes, started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config/spokes", get(get_spokes).post(add_spoke))
        .route(
            "/config/spokes/{name}",
            delete(delete_spoke).put(update_spoke),
        )
        .route("/config/{section}", get(get_section).put(put_section))
}

/// GET /config/spokes (alias of the section read, explicit for the CRUD set).
pub async fn get_spokes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    get_section(State(state), Path("spokes".to_string())).await
}
