// crates/daemon/src/promptgen.rs
//! Model-specific prompt additions generated from aggregated insights.
//!
//! Insights above the confidence/frequency bars (quirks additionally need a
//! workaround) are grouped by model and rendered into three capped sections.
//! The combined document is written atomically, registered as a prompt
//! version, and every contributing insight is stamped with that version in a
//! single transaction — the measurement loop keys off that deployment time.

use crate::control::Context;
use crate::maintenance::{MaintenanceError, MaintenanceResult};
use crate::ADDITIONS_PROMPT_NAME;
use chrono::{DateTime, Utc};
use pi_brain_core::insight::{AggregatedInsight, InsightType};
use pi_brain_db::{write_prompt_atomic, InsightFilter};
use std::collections::BTreeMap;
use tracing::info;

/// Minimum confidence for inclusion.
const MIN_CONFIDENCE: f64 = 0.5;

/// Minimum frequency for inclusion.
const MIN_FREQUENCY: i64 = 3;

/// Cap per section per model.
const SECTION_CAP: usize = 5;

/// Result of one generation pass.
#[derive(Debug, Default)]
pub struct PromptGenReport {
    pub models: usize,
    pub insights: usize,
    pub version: Option<String>,
}

fn eligible(insight: &AggregatedInsight) -> bool {
    if insight.confidence < MIN_CONFIDENCE || insight.frequency < MIN_FREQUENCY {
        return false;
    }
    // A quirk without a workaround is a complaint, not an instruction.
    if insight.insight_type == InsightType::Quirk && insight.workaround.is_none() {
        return false;
    }
    matches!(
        insight.insight_type,
        InsightType::Quirk | InsightType::Win | InsightType::ToolError
    )
}

fn render_line(insight: &AggregatedInsight) -> String {
    match (&insight.insight_type, &insight.workaround) {
        (InsightType::Quirk, Some(workaround)) => {
            format!("- {} — instead: {}", insight.pattern, workaround)
        }
        _ => format!("- {}", insight.pattern),
    }
}

/// Generate the additions document and deploy it. Returns what was written.
pub async fn generate(context: &Context, now: DateTime<Utc>) -> MaintenanceResult<PromptGenReport> {
    let insights = context.db.list_insights(&InsightFilter::default()).await?;
    let eligible_insights: Vec<&AggregatedInsight> =
        insights.iter().filter(|i| eligible(i)).collect();

    if eligible_insights.is_empty() {
        return Ok(PromptGenReport::default());
    }

    // Group by model; model-agnostic insights land under a general heading.
    let mut by_model: BTreeMap<String, Vec<&AggregatedInsight>> = BTreeMap::new();
    for insight in eligible_insights.iter().copied() {
        let model = insight
            .model
            .clone()
            .unwrap_or_else(|| "all models".to_string());
        by_model.entry(model).or_default().push(insight);
    }

    let mut doc = String::from("# Learned prompt additions\n");
    let mut additions: Vec<(String, String)> = Vec::new();

    for (model, model_insights) in &by_model {
        doc.push_str(&format!("\n## {model}\n"));
        for (heading, insight_type) in [
            ("Known quirks to avoid", InsightType::Quirk),
            ("Effective techniques", InsightType::Win),
            ("Tool usage reminders", InsightType::ToolError),
        ] {
            let section: Vec<&AggregatedInsight> = model_insights
                .iter()
                .copied()
                .filter(|i| i.insight_type == insight_type)
                .take(SECTION_CAP)
                .collect();
            if section.is_empty() {
                continue;
            }
            doc.push_str(&format!("\n### {heading}\n\n"));
            for insight in section {
                let line = render_line(insight);
                doc.push_str(&line);
                doc.push('\n');
                additions.push((insight.id.clone(), line));
            }
        }
    }

    let path = context
        .prompts_dir
        .join(format!("{ADDITIONS_PROMPT_NAME}.md"));
    write_prompt_atomic(&path, &doc)?;

    let version = context
        .db
        .register_prompt(&context.prompts_dir, ADDITIONS_PROMPT_NAME, now)
        .await?;

    context
        .db
        .update_insight_prompt_texts(&additions, &version.version)
        .await
        .map_err(MaintenanceError::Store)?;

    info!(
        models = by_model.len(),
        insights = additions.len(),
        version = %version.version,
        "prompt additions generated"
    );
    Ok(PromptGenReport {
        models: by_model.len(),
        insights: additions.len(),
        version: Some(version.version),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::test_support::maintenance_context;
    use pi_brain_core::insight::{insight_id, Severity};

    fn insight(
        insight_type: InsightType,
        model: Option<&str>,
        pattern: &str,
        confidence: f64,
        frequency: i64,
        workaround: Option<&str>,
    ) -> AggregatedInsight {
        AggregatedInsight {
            id: insight_id(insight_type, model, None, pattern),
            insight_type,
            model: model.map(String::from),
            tool: None,
            pattern: pattern.to_string(),
            frequency,
            confidence,
            severity: Severity::Medium,
            workaround: workaround.map(String::from),
            examples: vec![],
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            prompt_text: None,
            prompt_included: false,
            prompt_version: None,
        }
    }

    #[tokio::test]
    async fn test_generate_writes_sections_and_stamps_insights() {
        let (context, _dir) = maintenance_context().await;
        let quirk = insight(
            InsightType::Quirk,
            Some("model-x"),
            "invents file paths",
            0.8,
            5,
            Some("ask it to list the directory first"),
        );
        let win = insight(
            InsightType::Win,
            Some("model-x"),
            "give one example of the expected output",
            0.7,
            4,
            None,
        );
        let tool_error = insight(
            InsightType::ToolError,
            None,
            "unquoted globs in shell commands",
            0.9,
            6,
            None,
        );
        for i in [&quirk, &win, &tool_error] {
            context.db.upsert_insight(i).await.unwrap();
        }

        let report = generate(&context, Utc::now()).await.unwrap();
        assert_eq!(report.insights, 3);
        assert_eq!(report.models, 2, "model-x plus the model-agnostic group");
        let version = report.version.expect("a version was minted");

        let doc = std::fs::read_to_string(
            context.prompts_dir.join("model-additions.md"),
        )
        .unwrap();
        assert!(doc.contains("## model-x"));
        assert!(doc.contains("### Known quirks to avoid"));
        assert!(doc.contains("invents file paths — instead: ask it to list the directory first"));
        assert!(doc.contains("### Effective techniques"));
        assert!(doc.contains("### Tool usage reminders"));

        // Each contributing insight now carries the deployed version.
        for i in [&quirk, &win, &tool_error] {
            let stored = context.db.get_insight(&i.id).await.unwrap().unwrap();
            assert!(stored.prompt_included);
            assert_eq!(stored.prompt_version.as_deref(), Some(version.as_str()));
            assert!(stored.prompt_text.is_some());
        }
    }

    #[tokio::test]
    async fn test_quirk_without_workaround_excluded() {
        let (context, _dir) = maintenance_context().await;
        context
            .db
            .upsert_insight(&insight(
                InsightType::Quirk,
                Some("model-x"),
                "gets grumpy",
                0.9,
                9,
                None,
            ))
            .await
            .unwrap();

        let report = generate(&context, Utc::now()).await.unwrap();
        assert_eq!(report.insights, 0);
        assert!(report.version.is_none());
    }

    #[tokio::test]
    async fn test_thresholds_filter_weak_insights() {
        let (context, _dir) = maintenance_context().await;
        // Confident but rare.
        context
            .db
            .upsert_insight(&insight(InsightType::Win, None, "rare", 0.9, 2, None))
            .await
            .unwrap();
        // Frequent but unconfident.
        context
            .db
            .upsert_insight(&insight(InsightType::Win, None, "noisy", 0.2, 9, None))
            .await
            .unwrap();

        let report = generate(&context, Utc::now()).await.unwrap();
        assert_eq!(report.insights, 0);
    }

    #[tokio::test]
    async fn test_section_cap() {
        let (context, _dir) = maintenance_context().await;
        for i in 0..8 {
            context
                .db
                .upsert_insight(&insight(
                    InsightType::Win,
                    Some("model-x"),
                    &format!("technique {i}"),
                    0.9,
                    5,
                    None,
                ))
                .await
                .unwrap();
        }
        let report = generate(&context, Utc::now()).await.unwrap();
        assert_eq!(report.insights, 5, "capped per section");
    }

    #[tokio::test]
    async fn test_regeneration_with_same_content_reuses_version() {
        let (context, _dir) = maintenance_context().await;
        context
            .db
            .upsert_insight(&insight(InsightType::Win, None, "stable advice", 0.9, 5, None))
            .await
            .unwrap();

        let first = generate(&context, Utc::now()).await.unwrap();
        let second = generate(&context, Utc::now()).await.unwrap();
        assert_eq!(first.version, second.version, "same content, same hash, same version");
    }
}
