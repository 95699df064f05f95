// crates/db/src/edges.rs
//! Edge repository. Creation is idempotent per `(from, to, kind)`.

use crate::{Database, StoreResult};
use chrono::Utc;
use pi_brain_core::node::{Edge, EdgeKind};
use sqlx::Row;

impl Database {
    /// Create an edge; a duplicate `(from, to, kind)` is a no-op.
    /// Returns true when a new edge was written.
    pub async fn create_edge(
        &self,
        from: &str,
        to: &str,
        kind: EdgeKind,
        metadata: serde_json::Value,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO edges (from_node_id, to_node_id, kind, metadata, created_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(from_node_id, to_node_id, kind) DO NOTHING
"#,
        )
        .bind(from)
        .bind(to)
        .bind(kind.as_str())
        .bind(metadata.to_string())
        .bind(Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether an edge of this kind exists in either direction between the
    /// pair (used for the semantic-connection cooldown).
    pub async fn edge_exists_between(
        &self,
        a: &str,
        b: &str,
        kind: EdgeKind,
    ) -> StoreResult<bool> {
        let row: (i64,) = sqlx::query_as(
            r#"
SELECT COUNT(*) FROM edges
WHERE kind = ?
  AND ((from_node_id = ? AND to_node_id = ?) OR (from_node_id = ? AND to_node_id = ?))
"#,
        )
        .bind(kind.as_str())
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0 > 0)
    }

    /// All edges touching a node, optionally restricted to kinds.
    pub async fn edges_touching(
        &self,
        node_id: &str,
        kinds: &[EdgeKind],
    ) -> StoreResult<Vec<Edge>> {
        let mut sql = String::from(
            "SELECT from_node_id, to_node_id, kind, metadata FROM edges WHERE (from_node_id = ? OR to_node_id = ?)",
        );
        if !kinds.is_empty() {
            let placeholders = vec!["?"; kinds.len()].join(", ");
            sql.push_str(&format!(" AND kind IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = sqlx::query(&sql).bind(node_id).bind(node_id);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_edge).collect()
    }

    /// Total edge count, optionally by kind.
    pub async fn count_edges(&self, kind: Option<EdgeKind>) -> StoreResult<i64> {
        let row: (i64,) = match kind {
            Some(k) => {
                sqlx::query_as("SELECT COUNT(*) FROM edges WHERE kind = ?")
                    .bind(k.as_str())
                    .fetch_one(self.pool())
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM edges")
                    .fetch_one(self.pool())
                    .await?
            }
        };
        Ok(row.0)
    }
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Edge> {
    let kind_str: String = row.try_get("kind")?;
    let metadata_str: String = row.try_get("metadata")?;
    Ok(Edge {
        from_node_id: row.try_get("from_node_id")?,
        to_node_id: row.try_get("to_node_id")?,
        kind: EdgeKind::parse(&kind_str).unwrap_or(EdgeKind::References),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_create_edge_idempotent() {
        let db = Database::new_in_memory().await.unwrap();

        let created = db
            .create_edge("a", "b", EdgeKind::SemanticRelated, serde_json::json!({"similarity": 0.9}))
            .await
            .unwrap();
        assert!(created);

        let created_again = db
            .create_edge("a", "b", EdgeKind::SemanticRelated, serde_json::json!({"similarity": 0.8}))
            .await
            .unwrap();
        assert!(!created_again, "duplicate (from,to,kind) collapses");

        assert_eq!(db.count_edges(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_pair_different_kind_is_a_new_edge() {
        let db = Database::new_in_memory().await.unwrap();
        db.create_edge("a", "b", EdgeKind::Predecessor, serde_json::json!({}))
            .await
            .unwrap();
        db.create_edge("a", "b", EdgeKind::References, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(db.count_edges(None).await.unwrap(), 2);
        assert_eq!(db.count_edges(Some(EdgeKind::References)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edge_exists_between_is_direction_agnostic() {
        let db = Database::new_in_memory().await.unwrap();
        db.create_edge("a", "b", EdgeKind::SemanticRelated, serde_json::json!({}))
            .await
            .unwrap();
        assert!(db
            .edge_exists_between("a", "b", EdgeKind::SemanticRelated)
            .await
            .unwrap());
        assert!(db
            .edge_exists_between("b", "a", EdgeKind::SemanticRelated)
            .await
            .unwrap());
        assert!(!db
            .edge_exists_between("a", "b", EdgeKind::Fork)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_edges_touching_filters_by_kind() {
        let db = Database::new_in_memory().await.unwrap();
        db.create_edge("a", "b", EdgeKind::Predecessor, serde_json::json!({}))
            .await
            .unwrap();
        db.create_edge("c", "a", EdgeKind::Fork, serde_json::json!({}))
            .await
            .unwrap();

        let all = db.edges_touching("a", &[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let forks = db.edges_touching("a", &[EdgeKind::Fork]).await.unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].from_node_id, "c");
    }
}
