// crates/db/src/test_support.rs
//! Shared fixtures for store tests.

use chrono::TimeZone;
use pi_brain_core::boundary::Segment;
use pi_brain_core::node::*;

/// A minimal valid node whose id derives from the segment tuple.
pub fn sample_node(session_file: &str, start: &str, end: &str, project: &str) -> Node {
    let ts = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let session_id = session_file.trim_end_matches(".jsonl").to_string();
    Node {
        id: node_id(session_file, start, end),
        version: 1,
        source: NodeSource {
            session_file: session_file.to_string(),
            segment: Segment {
                session_file: session_file.to_string(),
                start_entry_id: start.to_string(),
                end_entry_id: end.to_string(),
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
            key_decisions: vec!["kept the existing schema".to_string()],
            files_touched: vec!["src/lib.rs".to_string()],
            tools_used: vec!["edit".to_string()],
            errors_seen: vec![],
        },
        lessons: Lessons {
            task: vec!["small commits land faster".to_string()],
            ..Default::default()
        },
        observations: Observations::default(),
        metadata: NodeMetadata {
            tokens_used: 1000,
            cost: 0.01,
            duration_minutes: 12.0,
            timestamp: ts,
            analyzed_at: ts,
            analyzer_version: "v1-aaaa1111".to_string(),
        },
        semantic: Semantic::default(),
        signals: Signals::default(),
        daemon_meta: DaemonMeta::default(),
    }
}
