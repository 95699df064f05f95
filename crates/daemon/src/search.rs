// crates/daemon/src/search.rs
//! Hybrid search: semantic first, full-text fallback.
//!
//! Falls back to FTS when no embedder is configured, when embedding the
//! query fails, or when fewer than `k` semantic hits clear the score
//! threshold. Fallback hits are appended after semantic ones, deduplicated
//! by node id.

use crate::embedder::Embedder;
use pi_brain_db::{Database, StoreResult};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// One hybrid search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub node_id: String,
    /// Cosine similarity for semantic hits; absent for FTS hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Highlighted snippet for FTS hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub source: SearchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Semantic,
    Fulltext,
}

/// Run a hybrid search over node summaries.
pub async fn hybrid_search(
    db: &Database,
    embedder: Option<&dyn Embedder>,
    query: &str,
    k: usize,
    min_score: f32,
) -> StoreResult<Vec<SearchHit>> {
    let mut hits: Vec<SearchHit> = Vec::new();

    if let Some(embedder) = embedder {
        match embedder.embed(&[query.to_string()]).await {
            Ok(vectors) => {
                if let Some(vector) = vectors.first() {
                    for hit in db.search_semantic(vector, k, min_score).await? {
                        hits.push(SearchHit {
                            node_id: hit.node_id,
                            score: Some(hit.score),
                            snippet: None,
                            source: SearchSource::Semantic,
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "query embedding failed, using full-text only"),
        }
    }

    // FTS fallback iff fewer than k semantic hits met the score bar.
    if hits.len() < k {
        debug!(semantic_hits = hits.len(), k, "falling back to full-text");
        let seen: HashSet<String> = hits.iter().map(|h| h.node_id.clone()).collect();
        for hit in db.search_fulltext(query, k as i64).await? {
            if hits.len() >= k {
                break;
            }
            if seen.contains(&hit.node_id) {
                continue;
            }
            hits.push(SearchHit {
                node_id: hit.node_id,
                score: None,
                snippet: Some(hit.snippet),
                source: SearchSource::Fulltext,
            });
        }
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::test_support::{embed_one, FakeEmbedder};
    use crate::maintenance::test_support::node;
    use pi_brain_db::Database;

    async fn seeded_db() -> (Database, Vec<String>) {
        let db = Database::new_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for (i, summary) in [
            "Fixed the watcher debounce race",
            "Rewrote scheduler lock handling",
            "Wrote documentation for the config file",
        ]
        .iter()
        .enumerate()
        {
            let mut n = node(&format!("s{i}.jsonl"), "proj");
            n.content.summary = summary.to_string();
            db.upsert_node(&n).await.unwrap();
            ids.push(n.id.clone());
        }
        (db, ids)
    }

    #[tokio::test]
    async fn test_no_embedder_uses_fts() {
        let (db, ids) = seeded_db().await;
        let hits = hybrid_search(&db, None, "watcher debounce", 5, 0.5)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, SearchSource::Fulltext);
        assert_eq!(hits[0].node_id, ids[0]);
        assert!(hits[0].snippet.as_deref().unwrap().contains("<b>"));
    }

    #[tokio::test]
    async fn test_semantic_hits_come_first() {
        let (db, ids) = seeded_db().await;
        let embedder = FakeEmbedder { dims: 32 };
        // Store embeddings aligned with the fake embedder's space.
        for (id, text) in ids.iter().zip([
            "Fixed the watcher debounce race",
            "Rewrote scheduler lock handling",
            "Wrote documentation for the config file",
        ]) {
            db.upsert_embedding(id, "fake-embedder", &embed_one(text, 32), "h")
                .await
                .unwrap();
        }

        let hits = hybrid_search(&db, Some(&embedder), "watcher debounce race", 2, 0.5)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, SearchSource::Semantic);
        assert_eq!(hits[0].node_id, ids[0]);
        assert!(hits[0].score.unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_low_similarity_falls_back_to_fts() {
        let (db, ids) = seeded_db().await;
        let embedder = FakeEmbedder { dims: 32 };
        for id in &ids {
            // Embeddings unrelated to any query the test makes.
            db.upsert_embedding(id, "fake-embedder", &embed_one("zzz qqq xxx", 32), "h")
                .await
                .unwrap();
        }

        let hits = hybrid_search(&db, Some(&embedder), "scheduler lock", 3, 0.9)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(
            hits.iter().all(|h| h.source == SearchSource::Fulltext),
            "nothing cleared the similarity bar: {hits:?}"
        );
    }

    #[tokio::test]
    async fn test_dedup_between_sources_and_k_cap() {
        let (db, ids) = seeded_db().await;
        let embedder = FakeEmbedder { dims: 32 };
        db.upsert_embedding(&ids[0], "fake-embedder", &embed_one("watcher debounce race", 32), "h")
            .await
            .unwrap();

        let hits = hybrid_search(&db, Some(&embedder), "watcher debounce race", 2, 0.5)
            .await
            .unwrap();
        assert!(hits.len() <= 2);
        let unique: HashSet<&str> = hits.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(unique.len(), hits.len(), "no duplicate node ids across sources");
    }
}
