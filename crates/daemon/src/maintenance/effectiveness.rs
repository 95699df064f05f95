// crates/daemon/src/maintenance/effectiveness.rs
//! Prompt effectiveness measurement and auto-disable.
//!
//! For each insight deployed to the prompt, occurrence rates are compared
//! between a window ending at the deployed version's install time and the
//! window since. Significance is a 2×2 chi-squared at p < 0.05; both windows
//! need a minimum session count. An insight whose latest measurement is
//! significantly negative — and still refers to the insight's current
//! version — is pulled from the prompt.

use super::MaintenanceResult;
use crate::control::Context;
use chrono::{DateTime, Duration, Utc};
use pi_brain_core::insight::{normalize_pattern, AggregatedInsight, InsightType};
use pi_brain_core::prompt::{EffectivenessWindow, PromptEffectiveness};
use pi_brain_core::stats::{improvement_pct, is_significant};
use pi_brain_core::Node;
use pi_brain_db::{effectiveness_id, InsightFilter};
use std::collections::HashSet;
use tracing::{debug, info};

/// Length of the before window, ending at prompt install.
const BEFORE_WINDOW_DAYS: i64 = 30;

/// Minimum sessions on each side for a measurement.
const MIN_SESSIONS: i64 = 5;

/// Auto-disable threshold: improvement below this (percent) disables.
const DISABLE_THRESHOLD_PCT: f64 = -10.0;

/// Result of one effectiveness pass.
#[derive(Debug, Default)]
pub struct EffectivenessOutcome {
    pub measured: usize,
    pub disabled: Vec<String>,
}

/// Measure every deployed insight, then auto-disable the harmful ones.
pub async fn run(context: &Context, now: DateTime<Utc>) -> MaintenanceResult<EffectivenessOutcome> {
    let deployed = context
        .db
        .list_insights(&InsightFilter {
            prompt_included: Some(true),
            ..Default::default()
        })
        .await?;

    let mut outcome = EffectivenessOutcome::default();
    for insight in &deployed {
        let Some(version) = &insight.prompt_version else {
            continue;
        };
        let Some(version_row) = context.db.get_prompt_version(version).await? else {
            debug!(insight = %insight.id, version = %version, "deployed version unknown, skipping");
            continue;
        };
        let install = version_row.created_at;

        let before_start = install - Duration::days(BEFORE_WINDOW_DAYS);
        let before_nodes = context.db.nodes_between(before_start, install).await?;
        let after_nodes = context.db.nodes_between(install, now).await?;

        let sessions_before = distinct_sessions(&before_nodes);
        let sessions_after = distinct_sessions(&after_nodes);
        if sessions_before < MIN_SESSIONS || sessions_after < MIN_SESSIONS {
            debug!(
                insight = %insight.id,
                sessions_before,
                sessions_after,
                "not enough sessions to measure"
            );
            continue;
        }

        let occurred_before = count_occurrences(&before_nodes, insight);
        let occurred_after = count_occurrences(&after_nodes, insight);

        let before_rate = occurred_before as f64 / sessions_before as f64;
        let after_rate = occurred_after as f64 / sessions_after as f64;
        let improvement = improvement_pct(before_rate, after_rate);
        let significant = is_significant(
            occurred_before,
            sessions_before,
            occurred_after,
            sessions_after,
        );

        let measurement = PromptEffectiveness {
            id: effectiveness_id(&insight.id, version),
            insight_id: insight.id.clone(),
            prompt_version: version.clone(),
            before: EffectivenessWindow {
                occurrences: occurred_before,
                severity: Some(insight.severity.as_str().to_string()),
                start: before_start,
                end: install,
            },
            after: EffectivenessWindow {
                occurrences: occurred_after,
                severity: Some(insight.severity.as_str().to_string()),
                start: install,
                end: now,
            },
            improvement_pct: improvement,
            statistically_significant: significant,
            sessions_before,
            sessions_after,
            measured_at: now,
        };
        context.db.upsert_effectiveness(&measurement).await?;
        outcome.measured += 1;
    }

    outcome.disabled = auto_disable(context, &deployed).await?;
    if outcome.measured > 0 || !outcome.disabled.is_empty() {
        info!(
            measured = outcome.measured,
            disabled = outcome.disabled.len(),
            "effectiveness pass complete"
        );
    }
    Ok(outcome)
}

/// Disable insights whose latest measurement is significantly negative and
/// still refers to the insight's current prompt version. Returns the ids.
pub async fn auto_disable(
    context: &Context,
    deployed: &[AggregatedInsight],
) -> MaintenanceResult<Vec<String>> {
    let mut disabled = Vec::new();
    for insight in deployed {
        if !insight.prompt_included {
            continue;
        }
        let Some(latest) = context.db.latest_effectiveness(&insight.id).await? else {
            continue;
        };
        let version_matches = insight.prompt_version.as_deref() == Some(&latest.prompt_version);
        if latest.statistically_significant
            && latest.improvement_pct < DISABLE_THRESHOLD_PCT
            && version_matches
        {
            context
                .db
                .set_insight_prompt_included(&insight.id, false)
                .await?;
            info!(
                insight = %insight.id,
                improvement = latest.improvement_pct,
                "insight auto-disabled"
            );
            disabled.push(insight.id.clone());
        }
    }
    Ok(disabled)
}

fn distinct_sessions(nodes: &[Node]) -> i64 {
    nodes
        .iter()
        .map(|n| n.source.session_id.as_str())
        .collect::<HashSet<_>>()
        .len() as i64
}

/// Count nodes in which the insight's pattern occurs, matched against the
/// observation list its type aggregates from.
fn count_occurrences(nodes: &[Node], insight: &AggregatedInsight) -> i64 {
    let needle = normalize_pattern(&insight.pattern);
    nodes
        .iter()
        .filter(|node| {
            let texts: Vec<&str> = match insight.insight_type {
                InsightType::Quirk => {
                    node.observations.model_quirks.iter().map(String::as_str).collect()
                }
                InsightType::Win => {
                    node.observations.prompting_wins.iter().map(String::as_str).collect()
                }
                InsightType::Failure => node
                    .observations
                    .prompting_failures
                    .iter()
                    .map(String::as_str)
                    .collect(),
                InsightType::ToolError => node
                    .observations
                    .tool_use_errors
                    .iter()
                    .map(String::as_str)
                    .collect(),
                InsightType::Lesson => node.lessons.all(),
            };
            texts.iter().any(|text| normalize_pattern(text) == needle)
        })
        .count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::test_support::{maintenance_context, node};
    use crate::ANALYZER_PROMPT_NAME;
    use pi_brain_core::insight::{insight_id, Severity};

    /// Seed nodes around an install time: `before` sessions before install
    /// with the quirk in `with_quirk_before` of them, similarly after.
    async fn seed_windows(
        context: &crate::control::Context,
        install: DateTime<Utc>,
        sessions_before: usize,
        with_quirk_before: usize,
        sessions_after: usize,
        with_quirk_after: usize,
    ) {
        for i in 0..sessions_before {
            let mut n = node(&format!("before-{i}.jsonl"), "proj");
            n.metadata.timestamp = install - Duration::days(1) - Duration::minutes(i as i64);
            if i < with_quirk_before {
                n.observations.model_quirks = vec!["drops error context".to_string()];
                n.observations.models_used = vec!["model-x".to_string()];
            }
            context.db.upsert_node(&n).await.unwrap();
        }
        for i in 0..sessions_after {
            let mut n = node(&format!("after-{i}.jsonl"), "proj");
            n.metadata.timestamp = install + Duration::days(1) + Duration::minutes(i as i64);
            if i < with_quirk_after {
                n.observations.model_quirks = vec!["drops error context".to_string()];
                n.observations.models_used = vec!["model-x".to_string()];
            }
            context.db.upsert_node(&n).await.unwrap();
        }
    }

    async fn deployed_insight(
        context: &crate::control::Context,
        version: &str,
    ) -> AggregatedInsight {
        let insight = AggregatedInsight {
            id: insight_id(InsightType::Quirk, Some("model-x"), None, "drops error context"),
            insight_type: InsightType::Quirk,
            model: Some("model-x".to_string()),
            tool: None,
            pattern: "drops error context".to_string(),
            frequency: 10,
            confidence: 0.9,
            severity: Severity::Medium,
            workaround: Some("quote errors verbatim".to_string()),
            examples: vec![],
            first_seen: Utc::now() - Duration::days(60),
            last_seen: Utc::now(),
            prompt_text: None,
            prompt_included: false,
            prompt_version: None,
        };
        context.db.upsert_insight(&insight).await.unwrap();
        context
            .db
            .update_insight_prompt_texts(
                &[(insight.id.clone(), "Avoid dropping error context".to_string())],
                version,
            )
            .await
            .unwrap();
        context.db.get_insight(&insight.id).await.unwrap().unwrap()
    }

    async fn install_version(context: &crate::control::Context, at: DateTime<Utc>) -> String {
        context
            .db
            .register_prompt(&context.prompts_dir, ANALYZER_PROMPT_NAME, at)
            .await
            .unwrap()
            .version
    }

    #[tokio::test]
    async fn test_measurement_improvement_and_significance() {
        let (context, _dir) = maintenance_context().await;
        let install = Utc::now() - Duration::days(10);
        let version = install_version(&context, install).await;
        let insight = deployed_insight(&context, &version).await;

        // 18/20 before, 2/20 after: large, significant improvement.
        seed_windows(&context, install, 20, 18, 20, 2).await;

        let outcome = run(&context, Utc::now()).await.unwrap();
        assert_eq!(outcome.measured, 1);
        assert!(outcome.disabled.is_empty());

        let measurement = context
            .db
            .latest_effectiveness(&insight.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(measurement.before.occurrences, 18);
        assert_eq!(measurement.after.occurrences, 2);
        assert!(measurement.statistically_significant);
        assert!((measurement.improvement_pct - (18.0 - 2.0) / 18.0 * 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_zero_before_rate_yields_zero_improvement() {
        let (context, _dir) = maintenance_context().await;
        let install = Utc::now() - Duration::days(10);
        let version = install_version(&context, install).await;
        let insight = deployed_insight(&context, &version).await;

        seed_windows(&context, install, 10, 0, 10, 5).await;

        run(&context, Utc::now()).await.unwrap();
        let measurement = context
            .db
            .latest_effectiveness(&insight.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(measurement.improvement_pct, 0.0);
        assert!(measurement.improvement_pct.is_finite());
    }

    #[tokio::test]
    async fn test_too_few_sessions_skips_measurement() {
        let (context, _dir) = maintenance_context().await;
        let install = Utc::now() - Duration::days(10);
        let version = install_version(&context, install).await;
        deployed_insight(&context, &version).await;

        seed_windows(&context, install, 3, 3, 20, 0).await;

        let outcome = run(&context, Utc::now()).await.unwrap();
        assert_eq!(outcome.measured, 0);
    }

    #[tokio::test]
    async fn test_auto_disable_scenario() {
        // A significantly harmful addition (−400 %), 20 sessions each side,
        // version still current: disabled and reported.
        let (context, _dir) = maintenance_context().await;
        let install = Utc::now() - Duration::days(10);
        let version = install_version(&context, install).await;
        let insight = deployed_insight(&context, &version).await;

        // 2/20 before, 10/20 after: rate went 0.1 → 0.5, improvement −400 %.
        seed_windows(&context, install, 20, 2, 20, 10).await;

        let outcome = run(&context, Utc::now()).await.unwrap();
        assert_eq!(outcome.measured, 1);
        assert_eq!(outcome.disabled, vec![insight.id.clone()]);

        let after = context.db.get_insight(&insight.id).await.unwrap().unwrap();
        assert!(!after.prompt_included);

        let measurement = context
            .db
            .latest_effectiveness(&insight.id)
            .await
            .unwrap()
            .unwrap();
        assert!((measurement.improvement_pct - (-400.0)).abs() < 1e-6);
        assert!(measurement.statistically_significant);
    }

    #[tokio::test]
    async fn test_stale_version_is_not_disabled() {
        let (context, _dir) = maintenance_context().await;
        let install = Utc::now() - Duration::days(10);
        let version = install_version(&context, install).await;
        let insight = deployed_insight(&context, &version).await;
        seed_windows(&context, install, 20, 2, 20, 10).await;

        // Measure against the old version, then redeploy under a new one.
        run(&context, Utc::now()).await.unwrap();
        context
            .db
            .set_insight_prompt_included(&insight.id, true)
            .await
            .unwrap();
        context
            .db
            .update_insight_prompt_texts(
                &[(insight.id.clone(), "new text".to_string())],
                "v99-ffffffff",
            )
            .await
            .unwrap();

        let deployed = context
            .db
            .list_insights(&InsightFilter {
                prompt_included: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let disabled = auto_disable(&context, &deployed).await.unwrap();
        assert!(
            disabled.is_empty(),
            "a measurement for a superseded version must not disable the current one"
        );
    }
}
