// crates/server/src/routes/nodes.rs
//! Node listing, lookup and graph traversal. Listings always return the
//! nested node shape, never raw rows.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_core::EdgeKind;
use pi_brain_db::{NodeFilter, NodeSort};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListQuery {
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub outcome: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub tag: Option<String>,
    pub topic: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

impl NodeListQuery {
    fn into_filter(self) -> Result<NodeFilter, ApiError> {
        let sort = match self.sort.as_deref() {
            None => NodeSort::Timestamp,
            Some(s) => NodeSort::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown sort key: {s}")))?,
        };
        let descending = match self.order.as_deref() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(other) => {
                return Err(ApiError::BadRequest(format!("unknown order: {other}")));
            }
        };
        Ok(NodeFilter {
            project: self.project,
            node_type: self.node_type,
            outcome: self.outcome,
            from: self.from,
            to: self.to,
            tag: self.tag,
            topic: self.topic,
            limit: self.limit.unwrap_or(50),
            offset: self.offset.unwrap_or(0),
            sort,
            descending,
        })
    }
}

/// GET /nodes
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let filter = query.into_filter()?;
    let nodes = state.db.list_nodes(&filter).await?;
    Ok(envelope(nodes, started))
}

/// GET /nodes/:id
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let node = state
        .db
        .get_node(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("node {id}")))?;
    Ok(envelope(node, started))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedQuery {
    /// Comma-separated edge kinds; empty means all.
    pub edge_kinds: Option<String>,
    pub depth: Option<usize>,
}

/// GET /nodes/:id/connected
pub async fn connected_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ConnectedQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    if state.db.get_node(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("node {id}")));
    }

    let kinds: Vec<EdgeKind> = match &query.edge_kinds {
        None => Vec::new(),
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                EdgeKind::parse(s.trim())
                    .ok_or_else(|| ApiError::BadRequest(format!("unknown edge kind: {s}")))
            })
            .collect::<Result<_, _>>()?,
    };
    let depth = query.depth.unwrap_or(1).min(5);

    let ids = state.db.traverse(&id, &kinds, depth).await?;
    let mut nodes = Vec::with_capacity(ids.len());
    for node_id in &ids {
        if let Some(node) = state.db.get_node(node_id).await? {
            nodes.push(node);
        }
    }
    let edges = state.db.edges_touching(&id, &kinds).await?;
    Ok(envelope(
        serde_json::json!({ "nodes": nodes, "edges": edges }),
        started,
    ))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/connected", get(connected_nodes))
}
