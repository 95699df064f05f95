// crates/daemon/src/maintenance/connections.rs
//! Connection discovery: semantic similarity, literal references and lesson
//! reinforcement.
//!
//! Edge writes are idempotent per `(from, to, kind)`, so two discovery runs
//! over the same data produce the same edge set, never duplicates. The
//! unique edge also acts as the pair's cooldown: once connected, a pair is
//! never re-examined.

use super::MaintenanceResult;
use crate::control::Context;
use chrono::{DateTime, Duration, Utc};
use pi_brain_core::insight::normalize_pattern;
use pi_brain_core::{EdgeKind, Node};
use pi_brain_db::cosine_similarity;
use regex_lite::Regex;
use tracing::{debug, info};

/// Cosine similarity at which two nodes count as semantically related.
const SEMANTIC_EDGE_THRESHOLD: f32 = 0.8;

/// A lesson shared by at least this many nodes is considered reinforced.
const LESSON_REINFORCE_MIN: i64 = 3;

/// Run all three discovery passes. Returns the number of edges created.
pub async fn run(context: &Context, now: DateTime<Utc>) -> MaintenanceResult<usize> {
    let lookback = Duration::days(context.config.daemon.connection_discovery_lookback_days);
    let recent = context.db.nodes_touched_since(now - lookback).await?;
    debug!(nodes = recent.len(), "connection discovery scanning recent nodes");

    let mut created = 0;
    created += discover_semantic(context, &recent).await?;
    created += discover_references(context, &recent).await?;
    created += discover_lesson_reinforcement(context).await?;

    if created > 0 {
        info!(created, "connection discovery created edges");
    }
    Ok(created)
}

/// Pairwise cosine similarity over recent nodes' embeddings.
async fn discover_semantic(context: &Context, recent: &[Node]) -> MaintenanceResult<usize> {
    let limit = context.config.daemon.connection_discovery_limit;
    let mut embedded: Vec<(&Node, Vec<f32>)> = Vec::new();
    for node in recent {
        if let Some(vector) = context.db.get_embedding(&node.id).await? {
            embedded.push((node, vector));
        }
    }

    let mut created = 0;
    'outer: for i in 0..embedded.len() {
        for j in (i + 1)..embedded.len() {
            if created >= limit {
                break 'outer;
            }
            let (a, va) = &embedded[i];
            let (b, vb) = &embedded[j];
            let similarity = cosine_similarity(va, vb);
            if similarity < SEMANTIC_EDGE_THRESHOLD {
                continue;
            }
            if context
                .db
                .edge_exists_between(&a.id, &b.id, EdgeKind::SemanticRelated)
                .await?
            {
                continue;
            }
            if context
                .db
                .create_edge(
                    &a.id,
                    &b.id,
                    EdgeKind::SemanticRelated,
                    serde_json::json!({ "similarity": similarity }),
                )
                .await?
            {
                created += 1;
            }
        }
    }
    Ok(created)
}

/// Scan key decisions and summaries for literal node-id mentions.
async fn discover_references(context: &Context, recent: &[Node]) -> MaintenanceResult<usize> {
    let id_pattern = Regex::new(r"\b[0-9a-f]{16}\b").expect("static regex compiles");
    let mut created = 0;

    for node in recent {
        let mut haystack = node.content.summary.clone();
        for decision in &node.content.key_decisions {
            haystack.push('\n');
            haystack.push_str(decision);
        }

        for capture in id_pattern.find_iter(&haystack) {
            let referenced = capture.as_str();
            if referenced == node.id {
                continue;
            }
            if context.db.get_node(referenced).await?.is_none() {
                continue;
            }
            if context
                .db
                .create_edge(
                    &node.id,
                    referenced,
                    EdgeKind::References,
                    serde_json::json!({ "source": "text-mention" }),
                )
                .await?
            {
                created += 1;
            }
        }
    }
    Ok(created)
}

/// Lessons whose normalized text recurs across enough nodes link those
/// nodes back to the earliest statement of the lesson.
async fn discover_lesson_reinforcement(context: &Context) -> MaintenanceResult<usize> {
    let aggregates = context.db.lesson_aggregates(LESSON_REINFORCE_MIN).await?;
    let mut created = 0;

    for aggregate in aggregates {
        let normalized = normalize_lesson(&aggregate.text);
        let node_ids = context.db.nodes_with_lesson(&normalized).await?;
        let Some((first, rest)) = node_ids.split_first() else {
            continue;
        };
        for later in rest {
            // One reinforcement edge per target; idempotency dedupes reruns.
            if context
                .db
                .create_edge(
                    later,
                    first,
                    EdgeKind::LessonReinforces,
                    serde_json::json!({ "lesson": normalize_pattern(&aggregate.text) }),
                )
                .await?
            {
                created += 1;
            }
        }
    }
    Ok(created)
}

/// Matching key used by the lessons table lookup (`LOWER(TRIM(text))`).
fn normalize_lesson(text: &str) -> String {
    text.trim().to_lowercase()
}
