// crates/daemon/src/maintenance/aggregation.rs
//! Pattern aggregation: group recurring observations across nodes into
//! `AggregatedInsight` rows.
//!
//! Two entry points share the grouping rules: the batch run recomputes
//! frequencies from every node and is authoritative; the per-node
//! incremental path keeps insights warm between batch runs as workers store
//! new nodes.

use super::MaintenanceResult;
use crate::control::Context;
use chrono::{DateTime, Utc};
use pi_brain_core::insight::{
    insight_id, normalize_pattern, AggregatedInsight, InsightType, Severity,
};
use pi_brain_core::Node;
use pi_brain_db::Database;
use std::collections::HashMap;
use tracing::info;

/// Frequency at which confidence saturates.
const CONFIDENCE_DIVISOR: f64 = 5.0;

/// Cap on example node ids kept per insight.
const MAX_EXAMPLES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    insight_type: InsightType,
    model: Option<String>,
    tool: Option<String>,
    pattern: String,
}

#[derive(Debug, Default)]
struct GroupAccumulator {
    raw_pattern: String,
    node_ids: Vec<String>,
    severities: Vec<Severity>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

/// Which observations of a node map into which insight groups.
fn observation_groups(node: &Node) -> Vec<(GroupKey, &str, Severity)> {
    let model = node.observations.models_used.first().cloned();
    let tool = node.content.tools_used.first().cloned();
    let severity = occurrence_severity(node);
    let mut groups = Vec::new();

    for quirk in &node.observations.model_quirks {
        groups.push((
            GroupKey {
                insight_type: InsightType::Quirk,
                model: model.clone(),
                tool: None,
                pattern: normalize_pattern(quirk),
            },
            quirk.as_str(),
            severity,
        ));
    }
    for win in &node.observations.prompting_wins {
        groups.push((
            GroupKey {
                insight_type: InsightType::Win,
                model: model.clone(),
                tool: None,
                pattern: normalize_pattern(win),
            },
            win.as_str(),
            Severity::Low,
        ));
    }
    for failure in &node.observations.prompting_failures {
        groups.push((
            GroupKey {
                insight_type: InsightType::Failure,
                model: model.clone(),
                tool: None,
                pattern: normalize_pattern(failure),
            },
            failure.as_str(),
            severity,
        ));
    }
    for error in &node.observations.tool_use_errors {
        groups.push((
            GroupKey {
                insight_type: InsightType::ToolError,
                model: None,
                tool: tool.clone(),
                pattern: normalize_pattern(error),
            },
            error.as_str(),
            severity,
        ));
    }
    for lesson in node.lessons.all() {
        groups.push((
            GroupKey {
                insight_type: InsightType::Lesson,
                model: None,
                tool: None,
                pattern: normalize_pattern(lesson),
            },
            lesson,
            Severity::Low,
        ));
    }
    groups
}

/// Severity of one occurrence, read off the node's friction signal.
fn occurrence_severity(node: &Node) -> Severity {
    let score = node.signals.friction.score;
    if score >= 0.7 {
        Severity::High
    } else if score >= 0.3 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Dominant severity and its share of the histogram.
fn severity_histogram(severities: &[Severity]) -> (Severity, f64) {
    if severities.is_empty() {
        return (Severity::Low, 1.0);
    }
    let mut counts: HashMap<Severity, usize> = HashMap::new();
    for severity in severities {
        *counts.entry(*severity).or_default() += 1;
    }
    let (dominant, count) = counts
        .into_iter()
        .max_by_key(|(severity, count)| (*count, *severity))
        .expect("non-empty histogram");
    (dominant, count as f64 / severities.len() as f64)
}

fn confidence(frequency: i64, consistency: f64) -> f64 {
    (frequency as f64 / CONFIDENCE_DIVISOR).min(1.0) * consistency
}

/// Full recompute over every node. Returns the number of insights upserted.
pub async fn run(context: &Context, _now: DateTime<Utc>) -> MaintenanceResult<usize> {
    let nodes = context.db.all_nodes().await?;
    let mut groups: HashMap<GroupKey, GroupAccumulator> = HashMap::new();

    for node in &nodes {
        for (key, raw, severity) in observation_groups(node) {
            if key.pattern.is_empty() {
                continue;
            }
            let acc = groups.entry(key).or_default();
            if acc.raw_pattern.is_empty() {
                acc.raw_pattern = raw.to_string();
            }
            if !acc.node_ids.contains(&node.id) {
                acc.node_ids.push(node.id.clone());
            }
            acc.severities.push(severity);
            let ts = node.metadata.timestamp;
            acc.first_seen = Some(acc.first_seen.map_or(ts, |f| f.min(ts)));
            acc.last_seen = Some(acc.last_seen.map_or(ts, |l| l.max(ts)));
        }
    }

    let mut upserted = 0;
    for (key, acc) in groups {
        let frequency = acc.node_ids.len() as i64;
        let (severity, consistency) = severity_histogram(&acc.severities);
        let insight = AggregatedInsight {
            id: insight_id(
                key.insight_type,
                key.model.as_deref(),
                key.tool.as_deref(),
                &key.pattern,
            ),
            insight_type: key.insight_type,
            model: key.model,
            tool: key.tool,
            pattern: acc.raw_pattern,
            frequency,
            confidence: confidence(frequency, consistency),
            severity,
            workaround: None,
            examples: acc.node_ids.into_iter().take(MAX_EXAMPLES).collect(),
            first_seen: acc.first_seen.unwrap_or_default(),
            last_seen: acc.last_seen.unwrap_or_default(),
            prompt_text: None,
            prompt_included: false,
            prompt_version: None,
        };
        context.db.upsert_insight(&insight).await?;
        upserted += 1;
    }

    info!(insights = upserted, nodes = nodes.len(), "pattern aggregation complete");
    Ok(upserted)
}

/// Incremental path used by workers right after a node is stored.
pub async fn apply_node_observations(db: &Database, node: &Node) -> MaintenanceResult<()> {
    for (key, raw, severity) in observation_groups(node) {
        if key.pattern.is_empty() {
            continue;
        }
        let id = insight_id(
            key.insight_type,
            key.model.as_deref(),
            key.tool.as_deref(),
            &key.pattern,
        );
        let ts = node.metadata.timestamp;

        let insight = match db.get_insight(&id).await? {
            Some(mut existing) => {
                if existing.examples.contains(&node.id) {
                    continue;
                }
                existing.frequency += 1;
                if existing.examples.len() < MAX_EXAMPLES {
                    existing.examples.push(node.id.clone());
                }
                existing.last_seen = existing.last_seen.max(ts);
                existing.first_seen = existing.first_seen.min(ts);
                // The batch run recomputes consistency; incrementally only
                // the frequency term moves.
                existing.confidence = confidence(existing.frequency, 1.0).max(existing.confidence);
                existing
            }
            None => AggregatedInsight {
                id,
                insight_type: key.insight_type,
                model: key.model,
                tool: key.tool,
                pattern: raw.to_string(),
                frequency: 1,
                confidence: confidence(1, 1.0),
                severity,
                workaround: None,
                examples: vec![node.id.clone()],
                first_seen: ts,
                last_seen: ts,
                prompt_text: None,
                prompt_included: false,
                prompt_version: None,
            },
        };
        db.upsert_insight(&insight).await?;
    }
    Ok(())
}
