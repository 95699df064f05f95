// crates/db/src/fts.rs
//! Full-text index over node summary documents (SQLite FTS5).
//!
//! The indexed document is derived from the node (`[type] summary` plus
//! decision and lesson bullets) and refreshed inside the same transaction as
//! the node row, so a summary is indexed iff the node row exists.

use crate::{Database, StoreResult};
use pi_brain_core::node::Node;
use serde::Serialize;
use sqlx::{Row, Sqlite, Transaction};

/// One full-text hit with a highlighted snippet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FtsHit {
    pub node_id: String,
    pub snippet: String,
    pub rank: f64,
}

/// Refresh the FTS row for a node (delete + insert) inside the caller's
/// transaction.
pub(crate) async fn index_for_search(
    tx: &mut Transaction<'_, Sqlite>,
    node: &Node,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM fts_nodes_summary WHERE node_id = ?")
        .bind(&node.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO fts_nodes_summary (node_id, summary) VALUES (?, ?)")
        .bind(&node.id)
        .bind(node.search_document())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Turn free-form user input into a safe FTS5 MATCH expression: each token
/// is double-quoted (phrase syntax), joined with implicit AND.
pub fn fts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|token| token.replace('"', ""))
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Database {
    /// Full-text search over node summaries with snippet highlights.
    pub async fn search_fulltext(&self, query: &str, limit: i64) -> StoreResult<Vec<FtsHit>> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
SELECT node_id,
       snippet(fts_nodes_summary, 1, '<b>', '</b>', '…', 12) AS snip,
       rank
FROM fts_nodes_summary
WHERE fts_nodes_summary MATCH ?
ORDER BY rank
LIMIT ?
"#,
        )
        .bind(&match_expr)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FtsHit {
                    node_id: row.try_get("node_id")?,
                    snippet: row.try_get("snip")?,
                    rank: row.try_get("rank")?,
                })
            })
            .collect()
    }

    /// Number of indexed summaries (invariant: equals the node count).
    pub async fn fts_count(&self) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fts_nodes_summary")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_node;
    use crate::Database;

    #[test]
    fn test_fts_query_quotes_tokens() {
        assert_eq!(fts_query("watcher debounce"), "\"watcher\" \"debounce\"");
        assert_eq!(fts_query("a \"b\" c"), "\"a\" \"b\" \"c\"");
        assert_eq!(fts_query("  "), "");
        assert_eq!(fts_query("\" \"\""), "", "quote-only tokens drop out");
    }

    #[tokio::test]
    async fn test_indexed_iff_node_exists() {
        let db = Database::new_in_memory().await.unwrap();
        assert_eq!(db.fts_count().await.unwrap(), 0);

        let node = sample_node("s1.jsonl", "e1", "e5", "proj-a");
        db.upsert_node(&node).await.unwrap();
        assert_eq!(db.fts_count().await.unwrap(), 1);

        // Re-upserting the same node doesn't duplicate the FTS row.
        db.upsert_node(&node).await.unwrap();
        assert_eq!(db.fts_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_finds_summary_terms() {
        let db = Database::new_in_memory().await.unwrap();
        let mut node = sample_node("s1.jsonl", "e1", "e5", "proj-a");
        node.content.summary = "Rewrote the scheduler lock handling".to_string();
        db.upsert_node(&node).await.unwrap();

        let hits = db.search_fulltext("scheduler lock", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id, node.id);
        assert!(hits[0].snippet.contains("<b>"));
    }

    #[tokio::test]
    async fn test_search_finds_lessons() {
        let db = Database::new_in_memory().await.unwrap();
        let mut node = sample_node("s1.jsonl", "e1", "e5", "proj-a");
        node.lessons.task = vec!["Always checkpoint the WAL before backup".to_string()];
        db.upsert_node(&node).await.unwrap();

        let hits = db.search_fulltext("checkpoint", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_reanalysis_updates_index() {
        let db = Database::new_in_memory().await.unwrap();
        let mut node = sample_node("s1.jsonl", "e1", "e5", "proj-a");
        node.content.summary = "original wording".to_string();
        db.upsert_node(&node).await.unwrap();

        node.content.summary = "replacement phrasing".to_string();
        node.metadata.analyzer_version = "v2-bbbb2222".to_string();
        db.upsert_node(&node).await.unwrap();

        assert!(db.search_fulltext("original", 10).await.unwrap().is_empty());
        assert_eq!(db.search_fulltext("replacement", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hostile_query_is_harmless() {
        let db = Database::new_in_memory().await.unwrap();
        let hits = db
            .search_fulltext("NEAR( OR \" drop table", 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
