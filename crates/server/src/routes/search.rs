// crates/server/src/routes/search.rs
//! Hybrid search endpoint: semantic with automatic full-text fallback.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_daemon::{hybrid_search, SearchHit};
use pi_brain_core::Node;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub q: String,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub outcome: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(flatten)]
    pub hit: SearchHit,
    pub node: Node,
}

/// GET /search
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q must not be empty".to_string()));
    }
    let limit = query.limit.unwrap_or(20).min(100);
    let min_score = state
        .config
        .read()
        .expect("config lock")
        .daemon
        .semantic_search_threshold;

    let hits = hybrid_search(
        &state.db,
        state.embedder.as_deref(),
        &query.q,
        limit,
        min_score,
    )
    .await?;

    // Resolve hits to nested nodes, applying the post-filters.
    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(node) = state.db.get_node(&hit.node_id).await? else {
            continue;
        };
        if let Some(node_type) = &query.node_type {
            if node.classification.node_type.as_str() != node_type {
                continue;
            }
        }
        if let Some(outcome) = &query.outcome {
            if node.content.outcome.as_str() != outcome {
                continue;
            }
        }
        results.push(SearchResult { hit, node });
    }
    Ok(envelope(results, started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/search", get(search))
}
