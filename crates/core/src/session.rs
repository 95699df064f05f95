// crates/core/src/session.rs
//! JSONL session file parsing.
//!
//! A session file is an append-only sequence of entries. The first line is a
//! header carrying `{version, id, timestamp, cwd, parentSession?}`; every
//! subsequent line is a typed entry with `{id, parentId, timestamp}`. Entries
//! form a DAG via `parentId`. Malformed lines are skipped with a debug log
//! rather than failing the whole file; unknown entry types parse as `Custom`
//! so newer session formats stay readable.

use crate::error::ParseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Session file header (first line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub version: i64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

/// One entry in a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

/// Typed entry payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EntryKind {
    Message {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: String,
    },
    Compaction {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        tokens_before: i64,
    },
    BranchSummary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        #[serde(default)]
        summary: String,
    },
    ModelChange {
        #[serde(default)]
        model: String,
    },
    Label {
        #[serde(default)]
        text: String,
    },
    SessionInfo,
    Custom,
}

impl EntryKind {
    /// Metadata entries don't participate in boundary detection or resume
    /// gap measurement.
    pub fn is_metadata(&self) -> bool {
        matches!(self, EntryKind::Label { .. } | EntryKind::SessionInfo)
    }
}

/// A fully parsed session file: header plus entries in stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSession {
    pub file: String,
    pub header: SessionHeader,
    pub entries: Vec<SessionEntry>,
}

impl ParsedSession {
    /// Look up an entry by id.
    pub fn entry(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Map of parent id → child entry ids, in stream order.
    pub fn children(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in &self.entries {
            if let Some(parent) = entry.parent_id.as_deref() {
                map.entry(parent).or_default().push(entry.id.as_str());
            }
        }
        map
    }

    /// The most recent entry with no children, by stream position.
    pub fn current_leaf(&self) -> Option<&SessionEntry> {
        let children = self.children();
        self.entries
            .iter()
            .rev()
            .find(|e| !children.contains_key(e.id.as_str()))
    }

    /// Render a segment's entries as analyzer input text.
    ///
    /// Messages become `role: content` lines; compactions and branch
    /// summaries contribute their summaries; metadata entries are skipped.
    pub fn render_entries(&self, start_id: &str, end_id: &str) -> String {
        let start = self.entries.iter().position(|e| e.id == start_id);
        let end = self.entries.iter().position(|e| e.id == end_id);
        let (Some(start), Some(end)) = (start, end) else {
            return String::new();
        };
        let mut out = String::new();
        for entry in &self.entries[start..=end] {
            match &entry.kind {
                EntryKind::Message { role, content } => {
                    out.push_str(role);
                    out.push_str(": ");
                    out.push_str(content);
                    out.push('\n');
                }
                EntryKind::Compaction { summary, .. } => {
                    out.push_str("[compaction] ");
                    out.push_str(summary);
                    out.push('\n');
                }
                EntryKind::BranchSummary { summary, .. } => {
                    out.push_str("[branch] ");
                    out.push_str(summary);
                    out.push('\n');
                }
                EntryKind::ModelChange { model } => {
                    out.push_str("[model] ");
                    out.push_str(model);
                    out.push('\n');
                }
                _ => {}
            }
        }
        out
    }
}

/// Parse session content (already read into memory).
///
/// The first parseable line must be the header; lines that fail to parse as
/// JSON or lack an `id` are skipped at debug level.
pub fn parse_session_str(content: &str, file: &Path) -> Result<ParsedSession, ParseError> {
    let mut header: Option<SessionHeader> = None;
    let mut entries: Vec<SessionEntry> = Vec::new();

    for (line_number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(line = line_number + 1, file = %file.display(), error = %e, "skipping malformed JSON line");
                continue;
            }
        };

        if header.is_none() {
            // The header is the first line; it carries `version` and `cwd`
            // rather than an entry type.
            match serde_json::from_value::<SessionHeader>(value.clone()) {
                Ok(h) => {
                    header = Some(h);
                    continue;
                }
                Err(e) => {
                    debug!(line = line_number + 1, file = %file.display(), error = %e, "first line is not a session header");
                    return Err(ParseError::MissingHeader {
                        path: file.to_owned(),
                    });
                }
            }
        }

        match serde_json::from_value::<SessionEntry>(value.clone()) {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                // Unknown entry type with a valid envelope still counts as
                // an entry; anything less is skipped.
                match parse_custom_envelope(&value) {
                    Some(entry) => entries.push(entry),
                    None => {
                        debug!(line = line_number + 1, file = %file.display(), "skipping entry with invalid envelope");
                    }
                }
            }
        }
    }

    let header = header.ok_or_else(|| ParseError::EmptyFile {
        path: file.to_owned(),
    })?;

    Ok(ParsedSession {
        file: file.to_string_lossy().into_owned(),
        header,
        entries,
    })
}

fn parse_custom_envelope(value: &serde_json::Value) -> Option<SessionEntry> {
    let id = value.get("id")?.as_str()?.to_string();
    let timestamp = value
        .get("timestamp")?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);
    let parent_id = value
        .get("parentId")
        .and_then(|v| v.as_str())
        .map(String::from);
    Some(SessionEntry {
        id,
        parent_id,
        timestamp,
        kind: EntryKind::Custom,
    })
}

/// Parse a session file from disk, streaming line by line.
pub async fn parse_session_file(path: &Path) -> Result<ParsedSession, ParseError> {
    let file = File::open(path).await.map_err(|e| ParseError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut content = String::new();
    while let Some(line) = lines.next_line().await.map_err(|e| ParseError::io(path, e))? {
        content.push_str(&line);
        content.push('\n');
    }
    parse_session_str(&content, path)
}

/// Read only the header line of a session file (for fork-graph construction).
pub async fn read_session_header(path: &Path) -> Result<SessionHeader, ParseError> {
    let file = File::open(path).await.map_err(|e| ParseError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.map_err(|e| ParseError::io(path, e))? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        return serde_json::from_value(value).map_err(|_| ParseError::MissingHeader {
            path: path.to_owned(),
        });
    }
    Err(ParseError::EmptyFile {
        path: path.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header_line(id: &str) -> String {
        format!(
            r#"{{"version":1,"id":"{id}","timestamp":"2026-03-01T10:00:00Z","cwd":"/home/u/proj"}}"#
        )
    }

    fn message_line(id: &str, parent: Option<&str>, ts: &str) -> String {
        let parent = parent
            .map(|p| format!(r#""parentId":"{p}","#))
            .unwrap_or_default();
        format!(
            r#"{{"type":"message","id":"{id}",{parent}"timestamp":"{ts}","role":"user","content":"hello"}}"#
        )
    }

    #[test]
    fn test_parse_minimal_session() {
        let content = format!(
            "{}\n{}\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
            message_line("e2", Some("e1"), "2026-03-01T10:00:02Z"),
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        assert_eq!(session.header.id, "s1");
        assert_eq!(session.entries.len(), 2);
        assert_eq!(session.entries[1].parent_id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let content = format!(
            "{}\nnot json at all\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        assert_eq!(session.entries.len(), 1);
    }

    #[test]
    fn test_parse_unknown_entry_type_as_custom() {
        let content = format!(
            "{}\n{}\n",
            header_line("s1"),
            r#"{"type":"telemetry_blob","id":"e1","timestamp":"2026-03-01T10:00:01Z","payload":{"x":1}}"#,
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        assert_eq!(session.entries.len(), 1);
        assert_eq!(session.entries[0].kind, EntryKind::Custom);
    }

    #[test]
    fn test_parse_empty_file() {
        let err = parse_session_str("", Path::new("empty.jsonl")).unwrap_err();
        assert!(matches!(err, ParseError::EmptyFile { .. }));
    }

    #[test]
    fn test_parse_missing_header() {
        let content = message_line("e1", None, "2026-03-01T10:00:01Z");
        let err = parse_session_str(&content, Path::new("bad.jsonl")).unwrap_err();
        assert!(matches!(err, ParseError::MissingHeader { .. }));
    }

    #[test]
    fn test_header_with_parent_session() {
        let content = r#"{"version":1,"id":"s2","timestamp":"2026-03-01T10:00:00Z","cwd":"/p","parentSession":"s1"}"#;
        let session = parse_session_str(content, Path::new("s2.jsonl")).unwrap();
        assert_eq!(session.header.parent_session.as_deref(), Some("s1"));
    }

    #[test]
    fn test_current_leaf_linear_chain() {
        let content = format!(
            "{}\n{}\n{}\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
            message_line("e2", Some("e1"), "2026-03-01T10:00:02Z"),
            message_line("e3", Some("e2"), "2026-03-01T10:00:03Z"),
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        assert_eq!(session.current_leaf().unwrap().id, "e3");
    }

    #[test]
    fn test_current_leaf_after_tree_jump() {
        // e3 branches off e1, leaving e2 as an abandoned leaf; the current
        // leaf is the most recent childless entry.
        let content = format!(
            "{}\n{}\n{}\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
            message_line("e2", Some("e1"), "2026-03-01T10:00:02Z"),
            message_line("e3", Some("e1"), "2026-03-01T10:00:03Z"),
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        assert_eq!(session.current_leaf().unwrap().id, "e3");
    }

    #[test]
    fn test_metadata_classification() {
        let label = EntryKind::Label {
            text: "wip".to_string(),
        };
        let info = EntryKind::SessionInfo;
        let msg = EntryKind::Message {
            role: "user".to_string(),
            content: "hi".to_string(),
        };
        assert!(label.is_metadata());
        assert!(info.is_metadata());
        assert!(!msg.is_metadata());
    }

    #[test]
    fn test_entry_kind_tagged_serialization() {
        let entry = SessionEntry {
            id: "e1".to_string(),
            parent_id: None,
            timestamp: "2026-03-01T10:00:00Z".parse().unwrap(),
            kind: EntryKind::Compaction {
                summary: "squashed".to_string(),
                tokens_before: 90_000,
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"compaction\""));
        assert!(json.contains("\"tokensBefore\":90000"));

        let back: SessionEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_render_entries_skips_metadata() {
        let content = format!(
            "{}\n{}\n{}\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
            r#"{"type":"label","id":"e2","parentId":"e1","timestamp":"2026-03-01T10:00:02Z","text":"checkpoint"}"#,
            message_line("e3", Some("e2"), "2026-03-01T10:00:03Z"),
        );
        let session = parse_session_str(&content, Path::new("s1.jsonl")).unwrap();
        let rendered = session.render_entries("e1", "e3");
        assert_eq!(rendered.matches("user: hello").count(), 2);
        assert!(!rendered.contains("checkpoint"));
    }

    #[tokio::test]
    async fn test_parse_session_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let content = format!(
            "{}\n{}\n",
            header_line("s1"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
        );
        tokio::fs::write(&path, content).await.unwrap();

        let session = parse_session_file(&path).await.unwrap();
        assert_eq!(session.header.id, "s1");
        assert_eq!(session.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_parse_session_file_not_found() {
        let err = parse_session_file(Path::new("/nonexistent/file.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_read_session_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let content = format!(
            "{}\n{}\n",
            header_line("s9"),
            message_line("e1", None, "2026-03-01T10:00:01Z"),
        );
        tokio::fs::write(&path, content).await.unwrap();

        let header = read_session_header(&path).await.unwrap();
        assert_eq!(header.id, "s9");
    }
}
