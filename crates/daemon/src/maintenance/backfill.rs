// crates/daemon/src/maintenance/backfill.rs
//! Embedding backfill: nodes without an embedding, or whose summary document
//! changed since it was embedded, get re-embedded in batches.

use super::{MaintenanceError, MaintenanceResult};
use crate::control::Context;
use crate::worker::doc_hash;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Embedding batch size.
const EMBED_BATCH: usize = 32;

/// Run one backfill pass, bounded by `backfill_limit`. Returns the number of
/// embeddings written.
pub async fn run(context: &Context, _now: DateTime<Utc>) -> MaintenanceResult<usize> {
    let embedder = context
        .embedder
        .as_ref()
        .ok_or_else(|| MaintenanceError::Other("no embedder configured".to_string()))?;

    let limit = context.config.daemon.backfill_limit;
    let candidates = context.db.embedding_backfill_candidates().await?;

    // Keep nodes whose embedding is missing, or whose stored text hash no
    // longer matches the current summary document.
    let mut pending: Vec<(String, String, String)> = Vec::new();
    for (node, stored_hash) in &candidates {
        if pending.len() >= limit {
            break;
        }
        let doc = node.search_document();
        let expected = doc_hash(&doc);
        if stored_hash.as_deref() != Some(expected.as_str()) {
            pending.push((node.id.clone(), doc, expected));
        }
    }

    let mut written = 0;
    for chunk in pending.chunks(EMBED_BATCH) {
        let texts: Vec<String> = chunk.iter().map(|(_, doc, _)| doc.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        for ((node_id, _, text_hash), vector) in chunk.iter().zip(vectors.iter()) {
            match context
                .db
                .upsert_embedding(node_id, embedder.model(), vector, text_hash)
                .await
            {
                Ok(()) => written += 1,
                // Dimension mismatches are logged and skipped, never fatal.
                Err(e) => warn!(node_id = %node_id, error = %e, "backfill write skipped"),
            }
        }
    }

    info!(written, candidates = pending.len(), "embedding backfill complete");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::test_support::{maintenance_context, node};

    #[tokio::test]
    async fn test_backfill_embeds_missing_nodes() {
        let (context, _dir) = maintenance_context().await;
        for i in 0..3 {
            context
                .db
                .upsert_node(&node(&format!("s{i}.jsonl"), "proj"))
                .await
                .unwrap();
        }
        assert_eq!(context.db.embedding_count().await.unwrap(), 0);

        let written = run(&context, Utc::now()).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(context.db.embedding_count().await.unwrap(), 3);

        // Second pass finds nothing stale.
        let written = run(&context, Utc::now()).await.unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_backfill_reembeds_changed_summary() {
        let (context, _dir) = maintenance_context().await;
        let mut n = node("s0.jsonl", "proj");
        context.db.upsert_node(&n).await.unwrap();
        run(&context, Utc::now()).await.unwrap();
        let before = context.db.get_embedding(&n.id).await.unwrap().unwrap();

        // Reanalysis rewrites the summary; the stored hash is now stale.
        n.content.summary = "A completely different reading of this work".to_string();
        n.metadata.analyzer_version = "v2-bbbb2222".to_string();
        context.db.upsert_node(&n).await.unwrap();

        let written = run(&context, Utc::now()).await.unwrap();
        assert_eq!(written, 1);
        let after = context.db.get_embedding(&n.id).await.unwrap().unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_backfill_respects_limit() {
        let (mut context_arc, _dir) = maintenance_context().await;
        {
            let context = std::sync::Arc::get_mut(&mut context_arc).unwrap();
            context.config.daemon.backfill_limit = 2;
        }
        let context = context_arc;
        for i in 0..5 {
            context
                .db
                .upsert_node(&node(&format!("s{i}.jsonl"), "proj"))
                .await
                .unwrap();
        }
        let written = run(&context, Utc::now()).await.unwrap();
        assert_eq!(written, 2);
    }
}
