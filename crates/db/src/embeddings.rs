// crates/db/src/embeddings.rs
//! Embedding storage and nearest-neighbor search.
//!
//! Embeddings live in `node_embeddings` (keyed by node id) and are mirrored
//! into `node_embeddings_vec`, a table keyed by a stable integer rowid with
//! the packed little-endian f32 vector. Both tables are written in the same
//! transaction so they can never diverge. Nearest-k runs as a cosine scan
//! over the mirror; with a local single-user store the scan is cheap and
//! avoids a native extension dependency.

use crate::{Database, StoreError, StoreResult};
use chrono::Utc;
use pi_brain_core::node::Node;
use serde::Serialize;
use sqlx::Row;
use tracing::warn;

/// One semantic search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticHit {
    pub node_id: String,
    pub score: f32,
}

/// Pack a vector as little-endian f32 bytes.
pub fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack little-endian f32 bytes.
pub fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity; 0 when either vector is all-zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl Database {
    /// Write an embedding to the main table and the vector mirror in one
    /// transaction.
    ///
    /// A dimension mismatch with already-stored embeddings is reported as
    /// `DimensionMismatch` without writing anything; callers treat it as a
    /// degraded condition, not a crash.
    pub async fn upsert_embedding(
        &self,
        node_id: &str,
        model: &str,
        vector: &[f32],
        text_hash: &str,
    ) -> StoreResult<()> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT dimensions FROM node_embeddings LIMIT 1")
                .fetch_optional(self.pool())
                .await?;
        if let Some((dims,)) = existing {
            if dims != vector.len() as i64 {
                warn!(
                    existing = dims,
                    incoming = vector.len(),
                    node_id,
                    "embedding dimension mismatch, skipping write"
                );
                return Err(StoreError::DimensionMismatch {
                    existing: dims,
                    incoming: vector.len() as i64,
                });
            }
        }

        let blob = encode_embedding(vector);
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
INSERT INTO node_embeddings (node_id, model, dimensions, embedding, text_hash, created_at)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(node_id) DO UPDATE SET
    model = excluded.model,
    dimensions = excluded.dimensions,
    embedding = excluded.embedding,
    text_hash = excluded.text_hash
"#,
        )
        .bind(node_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(&blob)
        .bind(text_hash)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
INSERT INTO node_embeddings_vec (node_id, embedding) VALUES (?, ?)
ON CONFLICT(node_id) DO UPDATE SET embedding = excluded.embedding
"#,
        )
        .bind(node_id)
        .bind(&blob)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fetch one node's embedding.
    pub async fn get_embedding(&self, node_id: &str) -> StoreResult<Option<Vec<f32>>> {
        let row = sqlx::query("SELECT embedding FROM node_embeddings WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("embedding");
            decode_embedding(&blob)
        }))
    }

    /// Nearest-k nodes by cosine similarity, filtered to `min_score`.
    pub async fn search_semantic(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
    ) -> StoreResult<Vec<SemanticHit>> {
        let rows = sqlx::query("SELECT node_id, embedding FROM node_embeddings_vec")
            .fetch_all(self.pool())
            .await?;

        let mut hits: Vec<SemanticHit> = rows
            .iter()
            .map(|row| {
                let node_id: String = row.get("node_id");
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query, &decode_embedding(&blob));
                SemanticHit { node_id, score }
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Backfill candidates: every latest node joined with the text hash its
    /// embedding was computed from (`None` when no embedding exists yet).
    /// Staleness is decided by the caller, which recomputes the hash of the
    /// current summary document — the stored hash alone cannot tell.
    pub async fn embedding_backfill_candidates(
        &self,
    ) -> StoreResult<Vec<(Node, Option<String>)>> {
        let rows = sqlx::query(
            r#"
SELECT n.node_json, e.text_hash
FROM nodes n
LEFT JOIN node_embeddings e ON e.node_id = n.id
ORDER BY n.timestamp ASC
"#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let json: String = row.try_get("node_json")?;
                let node: Node =
                    serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                        what: "stored node",
                        source: e,
                    })?;
                let text_hash: Option<String> = row.try_get("text_hash")?;
                Ok((node, text_hash))
            })
            .collect()
    }

    /// Count of stored embeddings.
    pub async fn embedding_count(&self) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM node_embeddings")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
