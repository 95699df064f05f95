// crates/server/src/routes/insights.rs
//! Insight reads plus the small write surface: edit, rating, manual flags.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use crate::error::{envelope, ApiError};
use crate::state::AppState;
use pi_brain_core::insight::{insight_id, AggregatedInsight, InsightType, Severity};
use pi_brain_db::InsightFilter;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightListQuery {
    #[serde(rename = "type")]
    pub insight_type: Option<String>,
    pub model: Option<String>,
    pub tool: Option<String>,
}

/// GET /insights
pub async fn list_insights(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InsightListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let insight_type = match &query.insight_type {
        None => None,
        Some(raw) => Some(
            InsightType::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown insight type: {raw}")))?,
        ),
    };
    let insights = state
        .db
        .list_insights(&InsightFilter {
            insight_type,
            model: query.model,
            tool: query.tool,
            prompt_included: None,
        })
        .await?;
    Ok(envelope(insights, started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightEdit {
    pub workaround: Option<String>,
    pub severity: Option<String>,
    pub prompt_included: Option<bool>,
}

/// PATCH /insights/:id
pub async fn edit_insight(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(edit): Json<InsightEdit>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    if state.db.get_insight(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("insight {id}")));
    }
    let severity = match &edit.severity {
        None => None,
        Some(raw) => Some(
            Severity::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown severity: {raw}")))?,
        ),
    };
    state
        .db
        .edit_insight(&id, edit.workaround.as_deref(), severity)
        .await?;
    if let Some(included) = edit.prompt_included {
        state.db.set_insight_prompt_included(&id, included).await?;
    }
    let updated = state.db.get_insight(&id).await?;
    Ok(envelope(updated, started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub up: bool,
}

/// POST /insights/:id/rating — thumbs up/down.
pub async fn rate_insight(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(rating): Json<Rating>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    if state.db.get_insight(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("insight {id}")));
    }
    state.db.rate_insight(&id, rating.up).await?;
    let updated = state.db.get_insight(&id).await?;
    Ok(envelope(updated, started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualFlag {
    #[serde(rename = "type")]
    pub insight_type: String,
    pub pattern: String,
    pub model: Option<String>,
    pub tool: Option<String>,
    pub severity: Option<String>,
    pub workaround: Option<String>,
}

/// POST /insights — manual flag creation.
pub async fn create_insight(
    State(state): State<Arc<AppState>>,
    Json(flag): Json<ManualFlag>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let insight_type = InsightType::parse(&flag.insight_type)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown insight type: {}", flag.insight_type)))?;
    if flag.pattern.trim().is_empty() {
        return Err(ApiError::BadRequest("pattern must not be empty".to_string()));
    }
    let severity = match &flag.severity {
        None => Severity::Medium,
        Some(raw) => Severity::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown severity: {raw}")))?,
    };
    let normalized = pi_brain_core::insight::normalize_pattern(&flag.pattern);
    let now = Utc::now();
    let insight = AggregatedInsight {
        id: insight_id(
            insight_type,
            flag.model.as_deref(),
            flag.tool.as_deref(),
            &normalized,
        ),
        insight_type,
        model: flag.model,
        tool: flag.tool,
        pattern: flag.pattern,
        frequency: 1,
        confidence: 1.0,
        severity,
        workaround: flag.workaround,
        examples: vec![],
        first_seen: now,
        last_seen: now,
        prompt_text: None,
        prompt_included: false,
        prompt_version: None,
    };
    state.db.upsert_insight(&insight).await?;
    let stored = state.db.get_insight(&insight.id).await?;
    Ok(envelope(stored, started))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/insights", get(list_insights).post(create_insight))
        .route("/insights/{id}", patch(edit_insight))
        .route("/insights/{id}/rating", post(rate_insight))
}
