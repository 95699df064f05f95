// crates/db/src/insights.rs
//! Aggregated-insight repository.
//!
//! Aggregation upserts keep deployment state (`prompt_text`,
//! `prompt_included`, `prompt_version`) untouched so the effectiveness loop
//! always sees the version an insight was actually deployed with.

use crate::{Database, StoreError, StoreResult};
use chrono::{DateTime, TimeZone, Utc};
use pi_brain_core::insight::{AggregatedInsight, InsightType, Severity};
use sqlx::Row;

fn row_to_insight(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AggregatedInsight> {
    let type_str: String = row.try_get("insight_type")?;
    let severity_str: String = row.try_get("severity")?;
    let examples_str: String = row.try_get("examples")?;
    let first_seen: i64 = row.try_get("first_seen")?;
    let last_seen: i64 = row.try_get("last_seen")?;
    let prompt_included: i64 = row.try_get("prompt_included")?;
    Ok(AggregatedInsight {
        id: row.try_get("id")?,
        insight_type: InsightType::parse(&type_str).unwrap_or(InsightType::Lesson),
        model: row.try_get("model")?,
        tool: row.try_get("tool")?,
        pattern: row.try_get("pattern")?,
        frequency: row.try_get("frequency")?,
        confidence: row.try_get("confidence")?,
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Low),
        workaround: row.try_get("workaround")?,
        examples: serde_json::from_str(&examples_str).unwrap_or_default(),
        first_seen: ts(first_seen),
        last_seen: ts(last_seen),
        prompt_text: row.try_get("prompt_text")?,
        prompt_included: prompt_included != 0,
        prompt_version: row.try_get("prompt_version")?,
    })
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

/// Filters for insight listing.
#[derive(Debug, Clone, Default)]
pub struct InsightFilter {
    pub insight_type: Option<InsightType>,
    pub model: Option<String>,
    pub tool: Option<String>,
    pub prompt_included: Option<bool>,
}

impl Database {
    /// Upsert an insight by id. On conflict the aggregation fields update,
    /// `first_seen` keeps its minimum, and prompt deployment state is
    /// preserved.
    pub async fn upsert_insight(&self, insight: &AggregatedInsight) -> StoreResult<()> {
        let examples = serde_json::to_string(&insight.examples).map_err(|e| StoreError::Serialize {
            what: "insight examples",
            source: e,
        })?;
        sqlx::query(
            r#"
INSERT INTO aggregated_insights (
    id, insight_type, model, tool, pattern, frequency, confidence, severity,
    workaround, examples, first_seen, last_seen,
    prompt_text, prompt_included, prompt_version
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    frequency = excluded.frequency,
    confidence = excluded.confidence,
    severity = excluded.severity,
    workaround = COALESCE(excluded.workaround, aggregated_insights.workaround),
    examples = excluded.examples,
    first_seen = MIN(aggregated_insights.first_seen, excluded.first_seen),
    last_seen = MAX(aggregated_insights.last_seen, excluded.last_seen)
"#,
        )
        .bind(&insight.id)
        .bind(insight.insight_type.as_str())
        .bind(&insight.model)
        .bind(&insight.tool)
        .bind(&insight.pattern)
        .bind(insight.frequency)
        .bind(insight.confidence)
        .bind(insight.severity.as_str())
        .bind(&insight.workaround)
        .bind(&examples)
        .bind(insight.first_seen.timestamp())
        .bind(insight.last_seen.timestamp())
        .bind(&insight.prompt_text)
        .bind(insight.prompt_included as i64)
        .bind(&insight.prompt_version)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_insight(&self, id: &str) -> StoreResult<Option<AggregatedInsight>> {
        let row = sqlx::query("SELECT * FROM aggregated_insights WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_insight).transpose()
    }

    /// Filtered listing, most frequent first.
    pub async fn list_insights(&self, filter: &InsightFilter) -> StoreResult<Vec<AggregatedInsight>> {
        let mut sql = String::from("SELECT * FROM aggregated_insights WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(t) = filter.insight_type {
            sql.push_str(" AND insight_type = ?");
            binds.push(t.as_str().to_string());
        }
        if let Some(model) = &filter.model {
            sql.push_str(" AND model = ?");
            binds.push(model.clone());
        }
        if let Some(tool) = &filter.tool {
            sql.push_str(" AND tool = ?");
            binds.push(tool.clone());
        }
        if let Some(included) = filter.prompt_included {
            sql.push_str(" AND prompt_included = ?");
            binds.push(if included { "1" } else { "0" }.to_string());
        }
        sql.push_str(" ORDER BY frequency DESC, last_seen DESC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_insight).collect()
    }

    /// Record generated prompt additions: each source insight gets its
    /// rendered text, `prompt_included = true`, and the deployed version, in
    /// one transaction so the measurement loop sees a single deployment
    /// timestamp.
    pub async fn update_insight_prompt_texts(
        &self,
        additions: &[(String, String)],
        prompt_version: &str,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for (insight_id, text) in additions {
            sqlx::query(
                r#"
UPDATE aggregated_insights
SET prompt_text = ?, prompt_included = 1, prompt_version = ?
WHERE id = ?
"#,
            )
            .bind(text)
            .bind(prompt_version)
            .bind(insight_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Flip one insight out of the prompt (auto-disable, manual edits).
    pub async fn set_insight_prompt_included(&self, id: &str, included: bool) -> StoreResult<()> {
        sqlx::query("UPDATE aggregated_insights SET prompt_included = ? WHERE id = ?")
            .bind(included as i64)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Manual edit surface: workaround and severity.
    pub async fn edit_insight(
        &self,
        id: &str,
        workaround: Option<&str>,
        severity: Option<Severity>,
    ) -> StoreResult<()> {
        if let Some(workaround) = workaround {
            sqlx::query("UPDATE aggregated_insights SET workaround = ? WHERE id = ?")
                .bind(workaround)
                .bind(id)
                .execute(self.pool())
                .await?;
        }
        if let Some(severity) = severity {
            sqlx::query("UPDATE aggregated_insights SET severity = ? WHERE id = ?")
                .bind(severity.as_str())
                .bind(id)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Thumbs up/down nudges confidence by ±0.1, clamped to [0, 1].
    pub async fn rate_insight(&self, id: &str, up: bool) -> StoreResult<()> {
        let delta = if up { 0.1 } else { -0.1 };
        sqlx::query(
            "UPDATE aggregated_insights SET confidence = MAX(0.0, MIN(1.0, confidence + ?)) WHERE id = ?",
        )
        .bind(delta)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
