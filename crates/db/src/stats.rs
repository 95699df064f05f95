// crates/db/src/stats.rs
//! Aggregate read queries for `/stats` and the insight rollups.

use crate::{Database, StoreResult};
use serde::Serialize;
use sqlx::Row;
use std::collections::HashMap;

/// Store-wide counts for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsOverview {
    pub total_nodes: i64,
    pub total_edges: i64,
    pub total_insights: i64,
    pub total_clusters: i64,
    pub nodes_by_type: HashMap<String, i64>,
    pub nodes_by_outcome: HashMap<String, i64>,
    pub nodes_by_project: HashMap<String, i64>,
}

/// One aggregated insight rollup row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightAggregate {
    pub key: String,
    pub count: i64,
}

/// One lesson/quirk aggregate row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonAggregate {
    pub level: String,
    pub text: String,
    pub node_count: i64,
}

impl Database {
    pub async fn stats_overview(&self) -> StoreResult<StatsOverview> {
        let mut overview = StatsOverview::default();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(self.pool())
            .await?;
        overview.total_nodes = row.0;
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edges")
            .fetch_one(self.pool())
            .await?;
        overview.total_edges = row.0;
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM aggregated_insights")
            .fetch_one(self.pool())
            .await?;
        overview.total_insights = row.0;
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM clusters")
            .fetch_one(self.pool())
            .await?;
        overview.total_clusters = row.0;

        for (column, target) in [
            ("node_type", &mut overview.nodes_by_type),
            ("outcome", &mut overview.nodes_by_outcome),
            ("project", &mut overview.nodes_by_project),
        ] {
            let rows = sqlx::query(&format!(
                "SELECT {column} AS k, COUNT(*) AS n FROM nodes GROUP BY {column}"
            ))
            .fetch_all(self.pool())
            .await?;
            for row in rows {
                let key: String = row.try_get("k")?;
                let n: i64 = row.try_get("n")?;
                target.insert(key, n);
            }
        }

        Ok(overview)
    }

    /// Insight counts grouped by a dimension (`insight_type`, `model`, `tool`).
    pub async fn insight_aggregates(&self, dimension: &str) -> StoreResult<Vec<InsightAggregate>> {
        // Column allow-list; the dimension comes from a route parameter.
        let column = match dimension {
            "model" => "model",
            "tool" => "tool",
            _ => "insight_type",
        };
        let rows = sqlx::query(&format!(
            "SELECT COALESCE({column}, '(none)') AS k, COUNT(*) AS n FROM aggregated_insights GROUP BY k ORDER BY n DESC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(InsightAggregate {
                    key: row.try_get("k")?,
                    count: row.try_get("n")?,
                })
            })
            .collect()
    }

    /// Lesson texts that recur across nodes, most reinforced first.
    pub async fn lesson_aggregates(&self, min_nodes: i64) -> StoreResult<Vec<LessonAggregate>> {
        let rows = sqlx::query(
            r#"
SELECT level, text, COUNT(DISTINCT node_id) AS n
FROM lessons
GROUP BY level, LOWER(TRIM(text))
HAVING n >= ?
ORDER BY n DESC
"#,
        )
        .bind(min_nodes)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LessonAggregate {
                    level: row.try_get("level")?,
                    text: row.try_get("text")?,
                    node_count: row.try_get("n")?,
                })
            })
            .collect()
    }

    /// Quirk texts per model with distinct-node counts.
    pub async fn quirk_aggregates(&self, min_nodes: i64) -> StoreResult<Vec<LessonAggregate>> {
        let rows = sqlx::query(
            r#"
SELECT COALESCE(model, '(unknown)') AS level, text, COUNT(DISTINCT node_id) AS n
FROM model_quirks
GROUP BY model, LOWER(TRIM(text))
HAVING n >= ?
ORDER BY n DESC
"#,
        )
        .bind(min_nodes)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LessonAggregate {
                    level: row.try_get("level")?,
                    text: row.try_get("text")?,
                    node_count: row.try_get("n")?,
                })
            })
            .collect()
    }
}
