// crates/db/src/effectiveness.rs
//! Prompt effectiveness measurements.
//!
//! One row per `(insight, prompt_version)`; re-measuring upserts the row and
//! preserves its original `created_at` so the deployment window stays fixed.

use crate::{Database, StoreResult};
use chrono::{DateTime, TimeZone, Utc};
use pi_brain_core::prompt::{EffectivenessWindow, PromptEffectiveness};
use sha2::{Digest, Sha256};
use sqlx::Row;

/// Deterministic measurement id from insight + version.
pub fn effectiveness_id(insight_id: &str, prompt_version: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [insight_id, prompt_version] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

fn row_to_measurement(row: &sqlx::sqlite::SqliteRow) -> StoreResult<PromptEffectiveness> {
    let significant: i64 = row.try_get("significant")?;
    Ok(PromptEffectiveness {
        id: row.try_get("id")?,
        insight_id: row.try_get("insight_id")?,
        prompt_version: row.try_get("prompt_version")?,
        before: EffectivenessWindow {
            occurrences: row.try_get("before_occurrences")?,
            severity: row.try_get("before_severity")?,
            start: ts(row.try_get("before_start")?),
            end: ts(row.try_get("before_end")?),
        },
        after: EffectivenessWindow {
            occurrences: row.try_get("after_occurrences")?,
            severity: row.try_get("after_severity")?,
            start: ts(row.try_get("after_start")?),
            end: ts(row.try_get("after_end")?),
        },
        improvement_pct: row.try_get("improvement_pct")?,
        statistically_significant: significant != 0,
        sessions_before: row.try_get("sessions_before")?,
        sessions_after: row.try_get("sessions_after")?,
        measured_at: ts(row.try_get("measured_at")?),
    })
}

impl Database {
    /// Upsert a measurement, preserving `created_at` across re-measurements.
    pub async fn upsert_effectiveness(
        &self,
        measurement: &PromptEffectiveness,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO prompt_effectiveness (
    id, insight_id, prompt_version,
    before_occurrences, before_severity, before_start, before_end,
    after_occurrences, after_severity, after_start, after_end,
    improvement_pct, significant, sessions_before, sessions_after,
    measured_at, created_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    before_occurrences = excluded.before_occurrences,
    before_severity = excluded.before_severity,
    before_start = excluded.before_start,
    before_end = excluded.before_end,
    after_occurrences = excluded.after_occurrences,
    after_severity = excluded.after_severity,
    after_start = excluded.after_start,
    after_end = excluded.after_end,
    improvement_pct = excluded.improvement_pct,
    significant = excluded.significant,
    sessions_before = excluded.sessions_before,
    sessions_after = excluded.sessions_after,
    measured_at = excluded.measured_at
"#,
        )
        .bind(&measurement.id)
        .bind(&measurement.insight_id)
        .bind(&measurement.prompt_version)
        .bind(measurement.before.occurrences)
        .bind(&measurement.before.severity)
        .bind(measurement.before.start.timestamp())
        .bind(measurement.before.end.timestamp())
        .bind(measurement.after.occurrences)
        .bind(&measurement.after.severity)
        .bind(measurement.after.start.timestamp())
        .bind(measurement.after.end.timestamp())
        .bind(measurement.improvement_pct)
        .bind(measurement.statistically_significant as i64)
        .bind(measurement.sessions_before)
        .bind(measurement.sessions_after)
        .bind(measurement.measured_at.timestamp())
        .bind(measurement.measured_at.timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Latest measurement for one insight.
    pub async fn latest_effectiveness(
        &self,
        insight_id: &str,
    ) -> StoreResult<Option<PromptEffectiveness>> {
        let row = sqlx::query(
            "SELECT * FROM prompt_effectiveness WHERE insight_id = ? ORDER BY measured_at DESC LIMIT 1",
        )
        .bind(insight_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_measurement).transpose()
    }

    /// All measurements for one insight, newest first.
    pub async fn list_effectiveness(
        &self,
        insight_id: &str,
    ) -> StoreResult<Vec<PromptEffectiveness>> {
        let rows = sqlx::query(
            "SELECT * FROM prompt_effectiveness WHERE insight_id = ? ORDER BY measured_at DESC",
        )
        .bind(insight_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_measurement).collect()
    }

    /// The stored `created_at` of a measurement (used by tests to assert
    /// preservation across upserts).
    pub async fn effectiveness_created_at(&self, id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT created_at FROM prompt_effectiveness WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| ts(r.get("created_at"))))
    }
}
