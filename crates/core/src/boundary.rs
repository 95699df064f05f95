// crates/core/src/boundary.rs
//! Semantic boundary detection and segment splitting.
//!
//! Boundaries cut a session's entry stream into segments, the unit of
//! analysis. Detection runs as a single pass over entries in stream order,
//! tracking the current leaf incrementally. `label` and `session_info`
//! entries are metadata: they neither trigger boundaries nor advance the
//! resume-gap clock. More than one boundary may land on the same entry, so
//! detections are kept as a list, never a position-keyed map.

use crate::session::{EntryKind, ParsedSession, SessionEntry};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Minimum gap between non-metadata entries that marks a resume.
pub const RESUME_GAP_MINUTES: i64 = 10;

/// A semantic cut in the entry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Boundary {
    Branch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        summary: String,
    },
    TreeJump {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        to_id: String,
    },
    Compaction {
        summary: String,
        tokens_before: i64,
    },
    Resume {
        gap_minutes: i64,
    },
    Fork {
        parent_session: String,
    },
}

impl Boundary {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Boundary::Branch { .. } => "branch",
            Boundary::TreeJump { .. } => "tree_jump",
            Boundary::Compaction { .. } => "compaction",
            Boundary::Resume { .. } => "resume",
            Boundary::Fork { .. } => "fork",
        }
    }
}

/// A boundary anchored to its position in the entry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedBoundary {
    /// Index into the session's entry list.
    pub position: usize,
    pub entry_id: String,
    pub boundary: Boundary,
}

/// A maximal run of entries between boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub session_file: String,
    pub start_entry_id: String,
    pub end_entry_id: String,
    pub entry_count: usize,
    pub start_boundaries: Vec<Boundary>,
    pub end_boundaries: Vec<Boundary>,
}

/// Detect all boundaries in a session, in stream order.
pub fn detect_boundaries(session: &ParsedSession) -> Vec<DetectedBoundary> {
    let mut boundaries: Vec<DetectedBoundary> = Vec::new();

    // Fork fires once, at position 0, when the header names a parent.
    if let Some(parent) = &session.header.parent_session {
        if let Some(first) = session.entries.first() {
            boundaries.push(DetectedBoundary {
                position: 0,
                entry_id: first.id.clone(),
                boundary: Boundary::Fork {
                    parent_session: parent.clone(),
                },
            });
        }
    }

    let mut current_leaf: Option<&SessionEntry> = None;
    let mut prev_position: Option<usize> = None;

    for (position, entry) in session.entries.iter().enumerate() {
        if entry.kind.is_metadata() {
            continue;
        }

        // Branch: the entry itself is a branch summary.
        let is_branch = if let EntryKind::BranchSummary { from_id, summary } = &entry.kind {
            boundaries.push(DetectedBoundary {
                position,
                entry_id: entry.id.clone(),
                boundary: Boundary::Branch {
                    from_id: from_id.clone().or_else(|| entry.parent_id.clone()),
                    summary: summary.clone(),
                },
            });
            true
        } else {
            false
        };

        // Tree jump: parent diverges from the tracked leaf, unless the
        // immediately preceding boundary was a branch (the branch already
        // explains the jump).
        if !is_branch {
            if let Some(leaf) = current_leaf {
                if entry.parent_id.as_deref() != Some(leaf.id.as_str()) {
                    let preceded_by_branch = boundaries.last().is_some_and(|b| {
                        matches!(b.boundary, Boundary::Branch { .. })
                            && Some(b.position) == prev_position
                    });
                    if !preceded_by_branch {
                        boundaries.push(DetectedBoundary {
                            position,
                            entry_id: entry.id.clone(),
                            boundary: Boundary::TreeJump {
                                from_id: Some(leaf.id.clone()),
                                to_id: entry
                                    .parent_id
                                    .clone()
                                    .unwrap_or_else(|| entry.id.clone()),
                            },
                        });
                    }
                }
            }
        }

        if let EntryKind::Compaction {
            summary,
            tokens_before,
        } = &entry.kind
        {
            boundaries.push(DetectedBoundary {
                position,
                entry_id: entry.id.clone(),
                boundary: Boundary::Compaction {
                    summary: summary.clone(),
                    tokens_before: *tokens_before,
                },
            });
        }

        // Resume: wall-clock gap since the previous non-metadata entry.
        if let Some(prev) = prev_position {
            let gap = entry.timestamp - session.entries[prev].timestamp;
            if gap >= Duration::minutes(RESUME_GAP_MINUTES) {
                boundaries.push(DetectedBoundary {
                    position,
                    entry_id: entry.id.clone(),
                    boundary: Boundary::Resume {
                        gap_minutes: gap.num_minutes(),
                    },
                });
            }
        }

        current_leaf = Some(entry);
        prev_position = Some(position);
    }

    boundaries
}

/// Split a session's entries into segments at boundary positions.
///
/// A boundary at position p opens a new segment starting at p; the
/// boundaries at that position become the new segment's start boundaries
/// and the previous segment's end boundaries. Empty segments are dropped.
pub fn split_segments(session: &ParsedSession, boundaries: &[DetectedBoundary]) -> Vec<Segment> {
    if session.entries.is_empty() {
        return Vec::new();
    }

    let mut split_positions: Vec<usize> = boundaries.iter().map(|b| b.position).collect();
    split_positions.sort_unstable();
    split_positions.dedup();

    let boundaries_at = |position: usize| -> Vec<Boundary> {
        boundaries
            .iter()
            .filter(|b| b.position == position)
            .map(|b| b.boundary.clone())
            .collect()
    };

    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut pending_starts: Vec<Boundary> = boundaries_at(0);

    for &pos in split_positions.iter().filter(|&&p| p > 0) {
        if pos > start {
            segments.push(Segment {
                session_file: session.file.clone(),
                start_entry_id: session.entries[start].id.clone(),
                end_entry_id: session.entries[pos - 1].id.clone(),
                entry_count: pos - start,
                start_boundaries: std::mem::take(&mut pending_starts),
                end_boundaries: boundaries_at(pos),
            });
        }
        pending_starts = boundaries_at(pos);
        start = pos;
    }

    let n = session.entries.len();
    if n > start {
        segments.push(Segment {
            session_file: session.file.clone(),
            start_entry_id: session.entries[start].id.clone(),
            end_entry_id: session.entries[n - 1].id.clone(),
            entry_count: n - start,
            start_boundaries: pending_starts,
            end_boundaries: Vec::new(),
        });
    }

    segments
}

/// Serialize segments to a JSON document (round-trips via [`parse_segments`]).
pub fn serialize_segments(segments: &[Segment]) -> String {
    serde_json::to_string_pretty(segments).unwrap_or_else(|_| "[]".to_string())
}

/// Parse segments back from [`serialize_segments`] output.
pub fn parse_segments(json: &str) -> Result<Vec<Segment>, serde_json::Error> {
    serde_json::from_str(json)
}
