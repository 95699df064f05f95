// crates/core/src/signals.rs
//! Friction and delight signal derivation.
//!
//! Signals are computed from the segment's raw entries, the analyzer's view
//! of the outcome, and the immediately prior node for the same project
//! (abandoned-restart detection). Scores are clamped to [0, 1].

use crate::boundary::Segment;
use crate::node::{
    AnalyzerPayload, DelightFlags, DelightSignal, FrictionFlags, FrictionSignal, Node, OutcomeKind,
    Signals,
};
use crate::session::{EntryKind, ParsedSession};

/// Errors-seen count at which repeated failure reads as churn.
const CHURN_ERROR_THRESHOLD: usize = 3;

/// Derive friction/delight signals for one analyzed segment.
pub fn derive_signals(
    session: &ParsedSession,
    segment: &Segment,
    payload: &AnalyzerPayload,
    prior_node: Option<&Node>,
) -> Signals {
    let user_messages = segment_user_messages(session, segment);
    let rephrasing = count_adjacent_user_pairs(session, segment) >= 2;
    let abandonment = payload.content.outcome == OutcomeKind::Abandoned;
    let churn = payload.content.errors_seen.len() >= CHURN_ERROR_THRESHOLD;
    let abandoned_restart = prior_node
        .map(|prior| {
            prior.content.outcome == OutcomeKind::Abandoned
                && prior.classification.project == payload.classification.project
        })
        .unwrap_or(false);

    let completed = payload.content.outcome == OutcomeKind::Completed;
    let had_errors = !payload.content.errors_seen.is_empty();
    let resilience = completed && had_errors;
    let one_shot_success = completed && user_messages == 1 && !had_errors;

    let weight = |flag: bool, value: f64| if flag { value } else { 0.0 };
    let friction_score = clamp01(
        weight(rephrasing, 0.3)
            + weight(abandonment, 0.4)
            + weight(churn, 0.2)
            + weight(abandoned_restart, 0.3),
    );
    let delight_score = clamp01(
        weight(resilience, 0.5) + weight(one_shot_success, 0.6) + weight(completed, 0.2),
    );

    Signals {
        friction: FrictionSignal {
            score: friction_score,
            flags: FrictionFlags {
                rephrasing,
                abandonment,
                churn,
                abandoned_restart,
            },
        },
        delight: DelightSignal {
            score: delight_score,
            flags: DelightFlags {
                resilience,
                one_shot_success,
            },
        },
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn segment_range(session: &ParsedSession, segment: &Segment) -> Option<(usize, usize)> {
    let start = session
        .entries
        .iter()
        .position(|e| e.id == segment.start_entry_id)?;
    let end = session
        .entries
        .iter()
        .position(|e| e.id == segment.end_entry_id)?;
    (start <= end).then_some((start, end))
}

fn segment_user_messages(session: &ParsedSession, segment: &Segment) -> usize {
    let Some((start, end)) = segment_range(session, segment) else {
        return 0;
    };
    session.entries[start..=end]
        .iter()
        .filter(|e| matches!(&e.kind, EntryKind::Message { role, .. } if role == "user"))
        .count()
}

/// Count pairs of user messages with no assistant message in between —
/// the user restating themselves.
fn count_adjacent_user_pairs(session: &ParsedSession, segment: &Segment) -> usize {
    let Some((start, end)) = segment_range(session, segment) else {
        return 0;
    };
    let mut pairs = 0;
    let mut previous_was_user = false;
    for entry in &session.entries[start..=end] {
        match &entry.kind {
            EntryKind::Message { role, .. } if role == "user" => {
                if previous_was_user {
                    pairs += 1;
                }
                previous_was_user = true;
            }
            EntryKind::Message { .. } => previous_was_user = false,
            // Metadata and structural entries don't break a rephrasing run.
            _ => {}
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Classification, Content, NodeType};
    use crate::session::parse_session_str;
    use std::path::Path;

    fn msg(id: &str, parent: Option<&str>, role: &str, ts: &str) -> String {
        let parent = parent
            .map(|p| format!(r#""parentId":"{p}","#))
            .unwrap_or_default();
        format!(
            r#"{{"type":"message","id":"{id}",{parent}"timestamp":"{ts}","role":"{role}","content":"x"}}"#
        )
    }

    fn session_with(lines: &[String]) -> ParsedSession {
        let header =
            r#"{"version":1,"id":"s1","timestamp":"2026-03-01T10:00:00Z","cwd":"/p"}"#.to_string();
        let content = std::iter::once(header)
            .chain(lines.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n");
        parse_session_str(&content, Path::new("s1.jsonl")).unwrap()
    }

    fn segment_over(session: &ParsedSession) -> Segment {
        Segment {
            session_file: session.file.clone(),
            start_entry_id: session.entries.first().unwrap().id.clone(),
            end_entry_id: session.entries.last().unwrap().id.clone(),
            entry_count: session.entries.len(),
            start_boundaries: vec![],
            end_boundaries: vec![],
        }
    }

    fn payload(outcome: OutcomeKind, errors: &[&str]) -> AnalyzerPayload {
        AnalyzerPayload {
            classification: Classification {
                node_type: NodeType::Feature,
                project: "demo".to_string(),
                is_new_project: false,
                had_clear_goal: true,
            },
            content: Content {
                summary: "did things".to_string(),
                outcome,
                key_decisions: vec![],
                files_touched: vec![],
                tools_used: vec![],
                errors_seen: errors.iter().map(|s| s.to_string()).collect(),
            },
            lessons: Default::default(),
            observations: Default::default(),
            semantic: Default::default(),
            metadata: None,
        }
    }

    #[test]
    fn test_one_shot_success() {
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "assistant", "2026-03-01T10:00:02Z"),
        ]);
        let segment = segment_over(&session);
        let signals = derive_signals(&session, &segment, &payload(OutcomeKind::Completed, &[]), None);

        assert!(signals.delight.flags.one_shot_success);
        assert!(!signals.delight.flags.resilience);
        assert!(signals.delight.score > 0.5);
        assert_eq!(signals.friction.score, 0.0);
    }

    #[test]
    fn test_resilience_requires_errors_and_completion() {
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "assistant", "2026-03-01T10:00:02Z"),
        ]);
        let segment = segment_over(&session);
        let signals = derive_signals(
            &session,
            &segment,
            &payload(OutcomeKind::Completed, &["E0502"]),
            None,
        );
        assert!(signals.delight.flags.resilience);
        assert!(!signals.delight.flags.one_shot_success, "errors disqualify one-shot");
    }

    #[test]
    fn test_rephrasing_detection() {
        // Three user messages in a row: two adjacent pairs.
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "user", "2026-03-01T10:00:02Z"),
            msg("e3", Some("e2"), "user", "2026-03-01T10:00:03Z"),
            msg("e4", Some("e3"), "assistant", "2026-03-01T10:00:04Z"),
        ]);
        let segment = segment_over(&session);
        let signals = derive_signals(&session, &segment, &payload(OutcomeKind::Partial, &[]), None);
        assert!(signals.friction.flags.rephrasing);
        assert!(signals.friction.score > 0.0);
    }

    #[test]
    fn test_abandonment_and_churn() {
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "assistant", "2026-03-01T10:00:02Z"),
        ]);
        let segment = segment_over(&session);
        let signals = derive_signals(
            &session,
            &segment,
            &payload(OutcomeKind::Abandoned, &["e1", "e2", "e3"]),
            None,
        );
        assert!(signals.friction.flags.abandonment);
        assert!(signals.friction.flags.churn);
        assert!(signals.friction.score >= 0.6);
        assert_eq!(signals.delight.score, 0.0);
    }

    #[test]
    fn test_abandoned_restart_from_prior_node() {
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "assistant", "2026-03-01T10:00:02Z"),
        ]);
        let segment = segment_over(&session);

        let mut prior = crate::node::Node {
            id: "prior".to_string(),
            version: 1,
            source: crate::node::NodeSource {
                session_file: "s0.jsonl".to_string(),
                segment: segment.clone(),
                session_id: "s0".to_string(),
                computer: "hub".to_string(),
            },
            classification: Classification {
                node_type: NodeType::Feature,
                project: "demo".to_string(),
                is_new_project: false,
                had_clear_goal: true,
            },
            content: Content {
                summary: "tried before".to_string(),
                outcome: OutcomeKind::Abandoned,
                key_decisions: vec![],
                files_touched: vec![],
                tools_used: vec![],
                errors_seen: vec![],
            },
            lessons: Default::default(),
            observations: Default::default(),
            metadata: crate::node::NodeMetadata {
                tokens_used: 0,
                cost: 0.0,
                duration_minutes: 0.0,
                timestamp: "2026-03-01T09:00:00Z".parse().unwrap(),
                analyzed_at: "2026-03-01T09:05:00Z".parse().unwrap(),
                analyzer_version: "v1-aaaa1111".to_string(),
            },
            semantic: Default::default(),
            signals: Default::default(),
            daemon_meta: Default::default(),
        };

        let signals = derive_signals(
            &session,
            &segment,
            &payload(OutcomeKind::Completed, &[]),
            Some(&prior),
        );
        assert!(signals.friction.flags.abandoned_restart);

        // A prior node from a different project doesn't count.
        prior.classification.project = "other".to_string();
        let signals = derive_signals(
            &session,
            &segment,
            &payload(OutcomeKind::Completed, &[]),
            Some(&prior),
        );
        assert!(!signals.friction.flags.abandoned_restart);
    }

    #[test]
    fn test_scores_clamped() {
        let session = session_with(&[
            msg("e1", None, "user", "2026-03-01T10:00:01Z"),
            msg("e2", Some("e1"), "user", "2026-03-01T10:00:02Z"),
            msg("e3", Some("e2"), "user", "2026-03-01T10:00:03Z"),
        ]);
        let segment = segment_over(&session);
        let prior_payload = payload(OutcomeKind::Abandoned, &["a", "b", "c"]);
        let signals = derive_signals(&session, &segment, &prior_payload, None);
        assert!(signals.friction.score <= 1.0);
        assert!(signals.delight.score <= 1.0);
    }
}
