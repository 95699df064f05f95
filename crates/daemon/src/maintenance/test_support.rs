// crates/daemon/src/maintenance/test_support.rs
//! Shared fixtures for maintenance tests.

use crate::analyzer::{AnalyzeRequest, Analyzer, AnalyzerError};
use crate::control::Context;
use crate::embedder::test_support::FakeEmbedder;
use async_trait::async_trait;
use chrono::TimeZone;
use pi_brain_core::boundary::Segment;
use pi_brain_core::node::*;
use pi_brain_core::Config;
use pi_brain_db::Database;
use std::sync::Arc;

/// Analyzer that always declines; clustering treats it as unavailable.
pub struct UnavailableAnalyzer;

#[async_trait]
impl Analyzer for UnavailableAnalyzer {
    async fn analyze(&self, _request: &AnalyzeRequest) -> Result<String, AnalyzerError> {
        Err(AnalyzerError::NotAvailable("test analyzer".to_string()))
    }

    async fn health_check(&self) -> Result<(), AnalyzerError> {
        Err(AnalyzerError::NotAvailable("test analyzer".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Context over an in-memory store with a fake embedder and an installed
/// analyzer prompt.
pub async fn maintenance_context() -> (Arc<Context>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new_in_memory()
        .await
        .unwrap()
        .with_nodes_dir(dir.path().join("nodes"));
    let prompts_dir = dir.path().join("prompts");
    pi_brain_db::install_default_prompt(
        &prompts_dir,
        crate::ANALYZER_PROMPT_NAME,
        crate::control::DEFAULT_ANALYZER_PROMPT,
    )
    .unwrap();
    let (events, _) = tokio::sync::broadcast::channel(64);
    let context = Arc::new(Context {
        db,
        config: Config::default(),
        analyzer: Arc::new(UnavailableAnalyzer),
        embedder: Some(Arc::new(FakeEmbedder { dims: 32 })),
        events,
        prompts_dir,
        computer: "test-host".to_string(),
    });
    (context, dir)
}

/// A stored-shape node fixture with deterministic id.
pub fn node(session_file: &str, project: &str) -> Node {
    let ts = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let session_id = session_file.trim_end_matches(".jsonl").to_string();
    Node {
        id: node_id(session_file, "e1", "e5"),
        version: 1,
        source: NodeSource {
            session_file: session_file.to_string(),
            segment: Segment {
                session_file: session_file.to_string(),
                start_entry_id: "e1".to_string(),
                end_entry_id: "e5".to_string(),
                entry_count: 5,
                start_boundaries: vec![],
                end_boundaries: vec![],
            },
            session_id,
            computer: "hub".to_string(),
        },
        classification: Classification {
            node_type: NodeType::Feature,
            project: project.to_string(),
            is_new_project: false,
            had_clear_goal: true,
        },
        content: Content {
            summary: format!("Worked on {project}"),
            outcome: OutcomeKind::Completed,
            key_decisions: vec![],
            files_touched: vec![],
            tools_used: vec!["edit".to_string()],
            errors_seen: vec![],
        },
        lessons: Lessons::default(),
        observations: Observations::default(),
        metadata: NodeMetadata {
            tokens_used: 100,
            cost: 0.0,
            duration_minutes: 5.0,
            timestamp: ts,
            analyzed_at: ts,
            analyzer_version: "v1-aaaa1111".to_string(),
        },
        semantic: Semantic::default(),
        signals: Signals::default(),
        daemon_meta: DaemonMeta::default(),
    }
}
