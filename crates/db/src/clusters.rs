// crates/db/src/clusters.rs
//! Cluster repository. Clustering recomputes pending clusters wholesale;
//! confirmed/dismissed clusters survive recomputation.

use crate::embeddings::{decode_embedding, encode_embedding};
use crate::{Database, StoreResult};
use chrono::Utc;
use pi_brain_core::insight::{Cluster, ClusterStatus, SignalType};
use sqlx::Row;

/// A cluster plus its member node ids, as produced by the clustering job.
#[derive(Debug, Clone)]
pub struct ClusterUpsert {
    pub cluster: Cluster,
    pub members: Vec<String>,
}

fn row_to_cluster(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Cluster> {
    let status_str: String = row.try_get("status")?;
    let signal_str: Option<String> = row.try_get("signal_type")?;
    let centroid_blob: Option<Vec<u8>> = row.try_get("centroid")?;
    Ok(Cluster {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        node_count: row.try_get("node_count")?,
        signal_type: signal_str.as_deref().and_then(SignalType::parse),
        related_model: row.try_get("related_model")?,
        status: ClusterStatus::parse(&status_str).unwrap_or(ClusterStatus::Pending),
        algorithm: row.try_get("algorithm")?,
        min_cluster_size: row.try_get("min_cluster_size")?,
        centroid: centroid_blob.map(|b| decode_embedding(&b)),
    })
}

impl Database {
    /// Replace the pending clusters for one signal type with a freshly
    /// computed set, members included, in a single transaction.
    pub async fn replace_pending_clusters(
        &self,
        signal_type: SignalType,
        upserts: &[ClusterUpsert],
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
DELETE FROM cluster_members WHERE cluster_id IN (
    SELECT id FROM clusters WHERE status = 'pending' AND signal_type = ?
)
"#,
        )
        .bind(signal_type.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM clusters WHERE status = 'pending' AND signal_type = ?")
            .bind(signal_type.as_str())
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().timestamp();
        for upsert in upserts {
            let cluster = &upsert.cluster;
            sqlx::query(
                r#"
INSERT INTO clusters (
    id, name, description, node_count, signal_type, related_model,
    status, algorithm, min_cluster_size, centroid, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    name = excluded.name,
    description = excluded.description,
    node_count = excluded.node_count,
    related_model = excluded.related_model,
    centroid = excluded.centroid,
    updated_at = excluded.updated_at
"#,
            )
            .bind(&cluster.id)
            .bind(&cluster.name)
            .bind(&cluster.description)
            .bind(cluster.node_count)
            .bind(cluster.signal_type.map(|s| s.as_str()))
            .bind(&cluster.related_model)
            .bind(cluster.status.as_str())
            .bind(&cluster.algorithm)
            .bind(cluster.min_cluster_size)
            .bind(cluster.centroid.as_deref().map(encode_embedding))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for node_id in &upsert.members {
                sqlx::query(
                    "INSERT OR IGNORE INTO cluster_members (cluster_id, node_id) VALUES (?, ?)",
                )
                .bind(&cluster.id)
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// All clusters, largest first.
    pub async fn list_clusters(&self) -> StoreResult<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY node_count DESC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_cluster).collect()
    }

    /// Member node ids of one cluster.
    pub async fn cluster_members(&self, cluster_id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT node_id FROM cluster_members WHERE cluster_id = ?")
            .bind(cluster_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("node_id")).collect())
    }

    /// Set cluster review status (confirm/dismiss from the UI).
    pub async fn set_cluster_status(&self, id: &str, status: ClusterStatus) -> StoreResult<()> {
        sqlx::query("UPDATE clusters SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Name/describe a cluster after the analyzer has looked at it.
    pub async fn describe_cluster(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE clusters SET name = ?, description = ? WHERE id = ?")
            .bind(name)
            .bind(description)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cluster(id: &str, signal: SignalType, status: ClusterStatus) -> ClusterUpsert {
        ClusterUpsert {
            cluster: Cluster {
                id: id.to_string(),
                name: None,
                description: None,
                node_count: 2,
                signal_type: Some(signal),
                related_model: None,
                status,
                algorithm: "density".to_string(),
                min_cluster_size: 2,
                centroid: Some(vec![0.5, 0.5]),
            },
            members: vec![format!("{id}-n1"), format!("{id}-n2")],
        }
    }

    #[tokio::test]
    async fn test_replace_pending_clusters() {
        let db = Database::new_in_memory().await.unwrap();
        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("c1", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();

        let clusters = db.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].centroid.as_deref(), Some(&[0.5f32, 0.5][..]));
        assert_eq!(db.cluster_members("c1").await.unwrap().len(), 2);

        // Recompute replaces the pending set.
        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("c2", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();
        let clusters = db.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "c2");
        assert!(db.cluster_members("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_clusters_survive_recompute() {
        let db = Database::new_in_memory().await.unwrap();
        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("keep", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();
        db.set_cluster_status("keep", ClusterStatus::Confirmed).await.unwrap();

        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("new", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();

        let ids: Vec<String> = db.list_clusters().await.unwrap().into_iter().map(|c| c.id).collect();
        assert!(ids.contains(&"keep".to_string()));
        assert!(ids.contains(&"new".to_string()));
    }

    #[tokio::test]
    async fn test_signal_types_are_independent() {
        let db = Database::new_in_memory().await.unwrap();
        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("f1", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();
        db.replace_pending_clusters(
            SignalType::Delight,
            &[sample_cluster("d1", SignalType::Delight, ClusterStatus::Pending)],
        )
        .await
        .unwrap();

        // Recomputing friction leaves delight untouched.
        db.replace_pending_clusters(SignalType::Friction, &[]).await.unwrap();
        let ids: Vec<String> = db.list_clusters().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_describe_cluster() {
        let db = Database::new_in_memory().await.unwrap();
        db.replace_pending_clusters(
            SignalType::Friction,
            &[sample_cluster("c1", SignalType::Friction, ClusterStatus::Pending)],
        )
        .await
        .unwrap();
        db.describe_cluster("c1", "Retry storms", "Sessions that loop on failing tests")
            .await
            .unwrap();
        let cluster = &db.list_clusters().await.unwrap()[0];
        assert_eq!(cluster.name.as_deref(), Some("Retry storms"));
    }
}
