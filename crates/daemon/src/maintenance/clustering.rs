// crates/daemon/src/maintenance/clustering.rs
//! Density clustering of friction/delight pattern texts.
//!
//! Pattern texts from signal-bearing nodes are embedded and grouped by a
//! greedy density pass: a point with at least `min_cluster_size - 1`
//! unassigned neighbors above the similarity floor seeds a cluster. The
//! analyzer (when available) names each cluster; without it clusters are
//! stored unnamed and the run still succeeds.

use super::{MaintenanceError, MaintenanceResult};
use crate::analyzer::AnalyzeRequest;
use crate::control::Context;
use chrono::{DateTime, Utc};
use pi_brain_core::insight::{Cluster, ClusterStatus, SignalType};
use pi_brain_core::node::extract_json_payload;
use pi_brain_db::{cosine_similarity, ClusterUpsert};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Similarity floor for cluster membership.
const CLUSTER_SIMILARITY: f32 = 0.75;

/// Embedding batch size.
const EMBED_BATCH: usize = 32;

struct PatternItem {
    text: String,
    node_id: String,
    model: Option<String>,
}

/// Run clustering for both signal types. Returns the cluster count.
pub async fn run(context: &Context, _now: DateTime<Utc>) -> MaintenanceResult<usize> {
    let embedder = context
        .embedder
        .as_ref()
        .ok_or_else(|| MaintenanceError::Other("no embedder configured".to_string()))?;

    let nodes = context.db.all_nodes().await?;
    let mut total = 0;

    for signal_type in [SignalType::Friction, SignalType::Delight] {
        let items = collect_patterns(&nodes, signal_type);
        let min_size = context.config.daemon.min_cluster_size;
        if items.len() < min_size {
            debug!(signal = signal_type.as_str(), items = items.len(), "too few patterns to cluster");
            context.db.replace_pending_clusters(signal_type, &[]).await?;
            continue;
        }

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(items.len());
        for chunk in items.chunks(EMBED_BATCH) {
            let texts: Vec<String> = chunk.iter().map(|item| item.text.clone()).collect();
            vectors.extend(embedder.embed(&texts).await?);
        }

        let groups = density_groups(&vectors, CLUSTER_SIMILARITY, min_size);
        let mut upserts = Vec::new();
        for group in &groups {
            let members: Vec<String> = group
                .iter()
                .map(|&index| items[index].node_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let centroid = centroid(&vectors, group);
            let related_model = dominant_model(&items, group);

            let cluster = Cluster {
                id: cluster_id(signal_type, &members),
                name: None,
                description: None,
                node_count: members.len() as i64,
                signal_type: Some(signal_type),
                related_model,
                status: ClusterStatus::Pending,
                algorithm: context.config.daemon.clustering_algorithm.clone(),
                min_cluster_size: min_size as i64,
                centroid: Some(centroid),
            };
            upserts.push(ClusterUpsert {
                cluster,
                members,
            });
        }

        context
            .db
            .replace_pending_clusters(signal_type, &upserts)
            .await?;
        total += upserts.len();

        // Best-effort naming; skipped when the analyzer is down.
        if context.analyzer.health_check().await.is_ok() {
            for (upsert, group) in upserts.iter().zip(groups.iter()) {
                if let Err(e) = name_cluster(context, upsert, &items, group).await {
                    warn!(cluster = %upsert.cluster.id, error = %e, "cluster naming failed");
                }
            }
        } else {
            debug!("analyzer unavailable, leaving clusters unnamed");
        }
    }

    info!(clusters = total, "clustering complete");
    Ok(total)
}

fn collect_patterns(nodes: &[pi_brain_core::Node], signal_type: SignalType) -> Vec<PatternItem> {
    let mut items = Vec::new();
    for node in nodes {
        let model = node.observations.models_used.first().cloned();
        match signal_type {
            SignalType::Friction if node.signals.friction.score > 0.0 => {
                for text in node
                    .observations
                    .prompting_failures
                    .iter()
                    .chain(&node.observations.model_quirks)
                {
                    items.push(PatternItem {
                        text: text.clone(),
                        node_id: node.id.clone(),
                        model: model.clone(),
                    });
                }
            }
            SignalType::Delight if node.signals.delight.score > 0.0 => {
                for text in &node.observations.prompting_wins {
                    items.push(PatternItem {
                        text: text.clone(),
                        node_id: node.id.clone(),
                        model: model.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    items
}

/// Greedy density pass over the similarity graph.
fn density_groups(vectors: &[Vec<f32>], floor: f32, min_size: usize) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; vectors.len()];
    let mut groups = Vec::new();

    for seed in 0..vectors.len() {
        if assigned[seed] {
            continue;
        }
        let mut members: Vec<usize> = vec![seed];
        for other in 0..vectors.len() {
            if other == seed || assigned[other] {
                continue;
            }
            if cosine_similarity(&vectors[seed], &vectors[other]) >= floor {
                members.push(other);
            }
        }
        if members.len() >= min_size {
            for &index in &members {
                assigned[index] = true;
            }
            groups.push(members);
        }
    }
    groups
}

fn centroid(vectors: &[Vec<f32>], group: &[usize]) -> Vec<f32> {
    let dims = vectors[group[0]].len();
    let mut sum = vec![0.0f32; dims];
    for &index in group {
        for (slot, value) in sum.iter_mut().zip(&vectors[index]) {
            *slot += value;
        }
    }
    let n = group.len() as f32;
    for slot in &mut sum {
        *slot /= n;
    }
    sum
}

fn dominant_model(items: &[PatternItem], group: &[usize]) -> Option<String> {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for &index in group {
        if let Some(model) = &items[index].model {
            *counts.entry(model.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(model, _)| model.to_string())
}

/// Stable cluster id from its signal and sorted member set.
fn cluster_id(signal_type: SignalType, members: &[String]) -> String {
    let mut sorted: Vec<&str> = members.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(signal_type.as_str().as_bytes());
    for member in sorted {
        hasher.update((member.len() as u64).to_le_bytes());
        hasher.update(member.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Ask the analyzer for a short name/description of one cluster.
async fn name_cluster(
    context: &Context,
    upsert: &ClusterUpsert,
    items: &[PatternItem],
    group: &[usize],
) -> MaintenanceResult<()> {
    let samples: Vec<&str> = group
        .iter()
        .take(10)
        .map(|&index| items[index].text.as_str())
        .collect();
    let request = AnalyzeRequest {
        provider: context.config.daemon.provider.clone(),
        model: context.config.daemon.model.clone(),
        system_prompt_path: context
            .prompts_dir
            .join(format!("{}.md", crate::ANALYZER_PROMPT_NAME)),
        capabilities: vec![],
        user_prompt: format!(
            "Name this group of recurring observations. Respond with JSON \
             {{\"name\": \"...\", \"description\": \"...\"}}.\n\n- {}",
            samples.join("\n- ")
        ),
        timeout: Duration::from_secs(60),
    };
    let response = context
        .analyzer
        .analyze(&request)
        .await
        .map_err(|e| MaintenanceError::Other(e.to_string()))?;
    let value = extract_json_payload(&response)
        .ok_or_else(|| MaintenanceError::Other("no JSON in naming response".to_string()))?;
    let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let description = value
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !name.is_empty() {
        context
            .db
            .describe_cluster(&upsert.cluster.id, name, description)
            .await?;
    }
    Ok(())
}
