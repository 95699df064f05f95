// crates/core/src/node.rs
//! The knowledge node: structured knowledge extracted from one segment.
//!
//! A node is persisted twice — a relational row indexed for query and a JSON
//! artifact on disk with the full nested content. The nested shape defined
//! here is the wire shape: API listings always return it, never raw rows.

use crate::boundary::Segment;
use crate::error::NodeValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Work classification for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Feature,
    Bugfix,
    Refactor,
    Exploration,
    Planning,
    Other,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Feature => "feature",
            NodeType::Bugfix => "bugfix",
            NodeType::Refactor => "refactor",
            NodeType::Exploration => "exploration",
            NodeType::Planning => "planning",
            NodeType::Other => "other",
        }
    }
}

/// How the segment's work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Completed,
    Partial,
    Abandoned,
    Blocked,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Completed => "completed",
            OutcomeKind::Partial => "partial",
            OutcomeKind::Abandoned => "abandoned",
            OutcomeKind::Blocked => "blocked",
        }
    }
}

/// Where the node came from. Set on INSERT, never overwritten by reanalysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSource {
    pub session_file: String,
    pub segment: Segment,
    pub session_id: String,
    pub computer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub project: String,
    #[serde(default)]
    pub is_new_project: bool,
    #[serde(default)]
    pub had_clear_goal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub summary: String,
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub errors_seen: Vec<String>,
}

/// Lessons keyed by level. Each level is a list of short strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lessons {
    #[serde(default)]
    pub project: Vec<String>,
    #[serde(default)]
    pub task: Vec<String>,
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub model: Vec<String>,
    #[serde(default)]
    pub tool: Vec<String>,
    #[serde(default)]
    pub skill: Vec<String>,
    #[serde(default)]
    pub subagent: Vec<String>,
}

impl Lessons {
    /// All lessons across levels, in a stable order.
    pub fn all(&self) -> Vec<&str> {
        [
            &self.project,
            &self.task,
            &self.user,
            &self.model,
            &self.tool,
            &self.skill,
            &self.subagent,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observations {
    #[serde(default)]
    pub models_used: Vec<String>,
    #[serde(default)]
    pub prompting_wins: Vec<String>,
    #[serde(default)]
    pub prompting_failures: Vec<String>,
    #[serde(default)]
    pub model_quirks: Vec<String>,
    #[serde(default)]
    pub tool_use_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_minutes: f64,
    pub timestamp: DateTime<Utc>,
    pub analyzed_at: DateTime<Utc>,
    pub analyzer_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Semantic {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrictionFlags {
    #[serde(default)]
    pub rephrasing: bool,
    #[serde(default)]
    pub abandonment: bool,
    #[serde(default)]
    pub churn: bool,
    #[serde(default)]
    pub abandoned_restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelightFlags {
    #[serde(default)]
    pub resilience: bool,
    #[serde(default)]
    pub one_shot_success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signals {
    pub friction: FrictionSignal,
    pub delight: DelightSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrictionSignal {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub flags: FrictionFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelightSignal {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub flags: DelightFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMeta {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub rlm_used: bool,
}

/// The canonical unit of knowledge derived from one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub version: i64,
    pub source: NodeSource,
    pub classification: Classification,
    pub content: Content,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub observations: Observations,
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub signals: Signals,
    #[serde(default)]
    pub daemon_meta: DaemonMeta,
}

/// Deterministic node id from the segment's identity tuple.
///
/// Each component is length-prefix framed before hashing so that moving
/// characters between components can never collide. First 16 hex chars of
/// the SHA-256 digest.
pub fn node_id(session_file: &str, start_entry_id: &str, end_entry_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [session_file, start_entry_id, end_entry_id] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl Node {
    /// The summary document indexed for full-text search and embedding.
    ///
    /// Format: `[type] summary`, then decisions and lessons as bullet lists.
    pub fn search_document(&self) -> String {
        let mut doc = format!(
            "[{}] {}",
            self.classification.node_type.as_str(),
            self.content.summary
        );
        if !self.content.key_decisions.is_empty() {
            doc.push_str("\n\nDecisions:");
            for decision in &self.content.key_decisions {
                doc.push_str("\n- ");
                doc.push_str(decision);
            }
        }
        let lessons = self.lessons.all();
        if !lessons.is_empty() {
            doc.push_str("\n\nLessons:");
            for lesson in lessons {
                doc.push_str("\n- ");
                doc.push_str(lesson);
            }
        }
        doc
    }
}

// ============================================================================
// Analyzer payload
// ============================================================================

/// The subset of a node the external analyzer produces.
///
/// The worker supplies identity, source, signals and daemon metadata; the
/// analyzer supplies classification, content, lessons, observations and
/// semantics, plus usage metadata when it has them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerPayload {
    pub classification: Classification,
    pub content: Content,
    #[serde(default)]
    pub lessons: Lessons,
    #[serde(default)]
    pub observations: Observations,
    #[serde(default)]
    pub semantic: Semantic,
    #[serde(default)]
    pub metadata: Option<AnalyzerUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerUsage {
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_minutes: f64,
}

/// Extract a JSON object from analyzer output text.
///
/// Prefers a fenced ```json block; otherwise takes the first brace-balanced
/// `{...}` region. Returns `None` when no parseable object exists.
pub fn extract_json_payload(text: &str) -> Option<serde_json::Value> {
    if let Some(fence_start) = text.find("```") {
        let after = &text[fence_start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(fence_end) = body.find("```") {
            if let Ok(v) = serde_json::from_str(body[..fence_end].trim()) {
                return Some(v);
            }
        }
    }
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + i + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate analyzer output text against the node schema.
pub fn validate_analyzer_response(text: &str) -> Result<AnalyzerPayload, NodeValidationError> {
    let value = extract_json_payload(text).ok_or(NodeValidationError::NoJsonFound)?;
    let payload: AnalyzerPayload =
        serde_json::from_value(value).map_err(|e| classify_payload_error(&e.to_string()))?;
    if payload.content.summary.trim().is_empty() {
        return Err(NodeValidationError::InvalidField {
            field: "content.summary".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if payload.classification.project.trim().is_empty() {
        return Err(NodeValidationError::InvalidField {
            field: "classification.project".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(payload)
}

fn classify_payload_error(message: &str) -> NodeValidationError {
    if let Some(field) = message.strip_prefix("missing field `") {
        if let Some(end) = field.find('`') {
            return NodeValidationError::MissingField {
                field: field[..end].to_string(),
            };
        }
    }
    NodeValidationError::InvalidField {
        field: "payload".to_string(),
        message: message.to_string(),
    }
}

// ============================================================================
// Edges
// ============================================================================

/// Typed directed link between nodes. Kinds 1–5 are structural (written at
/// ingestion); the rest are inferred by maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Branch,
    TreeJump,
    Compaction,
    Resume,
    Fork,
    Predecessor,
    SemanticRelated,
    References,
    LessonReinforces,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Branch => "branch",
            EdgeKind::TreeJump => "tree_jump",
            EdgeKind::Compaction => "compaction",
            EdgeKind::Resume => "resume",
            EdgeKind::Fork => "fork",
            EdgeKind::Predecessor => "predecessor",
            EdgeKind::SemanticRelated => "semantic_related",
            EdgeKind::References => "references",
            EdgeKind::LessonReinforces => "lesson_reinforces",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "branch" => Some(EdgeKind::Branch),
            "tree_jump" => Some(EdgeKind::TreeJump),
            "compaction" => Some(EdgeKind::Compaction),
            "resume" => Some(EdgeKind::Resume),
            "fork" => Some(EdgeKind::Fork),
            "predecessor" => Some(EdgeKind::Predecessor),
            "semantic_related" => Some(EdgeKind::SemanticRelated),
            "references" => Some(EdgeKind::References),
            "lesson_reinforces" => Some(EdgeKind::LessonReinforces),
            _ => None,
        }
    }

    /// Structural edges are produced during ingestion from boundaries and
    /// fork relations.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EdgeKind::Branch
                | EdgeKind::TreeJump
                | EdgeKind::Compaction
                | EdgeKind::Resume
                | EdgeKind::Fork
        )
    }
}

/// Directed link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from_node_id: String,
    pub to_node_id: String,
    pub kind: EdgeKind,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::Segment;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample_node() -> Node {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        Node {
            id: node_id("s1.jsonl", "e1", "e9"),
            version: 1,
            source: NodeSource {
                session_file: "s1.jsonl".to_string(),
                segment: Segment {
                    session_file: "s1.jsonl".to_string(),
                    start_entry_id: "e1".to_string(),
                    end_entry_id: "e9".to_string(),
                    entry_count: 9,
                    start_boundaries: vec![],
                    end_boundaries: vec![],
                },
                session_id: "s1".to_string(),
                computer: "hub".to_string(),
            },
            classification: Classification {
                node_type: NodeType::Bugfix,
                project: "pi-brain".to_string(),
                is_new_project: false,
                had_clear_goal: true,
            },
            content: Content {
                summary: "Fixed the watcher debounce race".to_string(),
                outcome: OutcomeKind::Completed,
                key_decisions: vec!["Use a quiet period instead of raw events".to_string()],
                files_touched: vec!["src/watcher.rs".to_string()],
                tools_used: vec!["edit".to_string()],
                errors_seen: vec![],
            },
            lessons: Lessons {
                task: vec!["Debounce before enqueueing".to_string()],
                ..Default::default()
            },
            observations: Observations::default(),
            metadata: NodeMetadata {
                tokens_used: 1200,
                cost: 0.02,
                duration_minutes: 14.0,
                timestamp: ts,
                analyzed_at: ts,
                analyzer_version: "v1-abcd1234".to_string(),
            },
            semantic: Semantic {
                tags: vec!["watcher".to_string()],
                topics: vec!["file-watching".to_string()],
            },
            signals: Signals::default(),
            daemon_meta: DaemonMeta::default(),
        }
    }

    // ========================================================================
    // Node id
    // ========================================================================

    #[test]
    fn test_node_id_deterministic() {
        let a = node_id("s1.jsonl", "e1", "e9");
        let b = node_id("s1.jsonl", "e1", "e9");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_node_id_sensitive_to_each_component() {
        let base = node_id("s1.jsonl", "e1", "e9");
        assert_ne!(base, node_id("s2.jsonl", "e1", "e9"));
        assert_ne!(base, node_id("s1.jsonl", "e2", "e9"));
        assert_ne!(base, node_id("s1.jsonl", "e1", "e8"));
    }

    #[test]
    fn test_node_id_length_prefix_prevents_shift_collisions() {
        // Without framing these two tuples would hash identically.
        assert_ne!(node_id("ab", "c", "d"), node_id("a", "bc", "d"));
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    #[test]
    fn test_node_round_trip() {
        let node = sample_node();
        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_node_wire_shape_is_camel_case() {
        let node = sample_node();
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"sessionFile\""));
        assert!(json.contains("\"keyDecisions\""));
        assert!(json.contains("\"analyzerVersion\""));
        assert!(json.contains("\"type\":\"bugfix\""));
        assert!(json.contains("\"outcome\":\"completed\""));
    }

    #[test]
    fn test_search_document_format() {
        let node = sample_node();
        let doc = node.search_document();
        assert!(doc.starts_with("[bugfix] Fixed the watcher debounce race"));
        assert!(doc.contains("\n\nDecisions:\n- Use a quiet period instead of raw events"));
        assert!(doc.contains("\n\nLessons:\n- Debounce before enqueueing"));
    }

    #[test]
    fn test_search_document_omits_empty_sections() {
        let mut node = sample_node();
        node.content.key_decisions.clear();
        node.lessons = Lessons::default();
        let doc = node.search_document();
        assert!(!doc.contains("Decisions:"));
        assert!(!doc.contains("Lessons:"));
    }

    // ========================================================================
    // Analyzer payload extraction & validation
    // ========================================================================

    fn minimal_payload_json() -> &'static str {
        r#"{
            "classification": {"type": "feature", "project": "demo", "isNewProject": false, "hadClearGoal": true},
            "content": {"summary": "Added a thing", "outcome": "completed"}
        }"#
    }

    #[test]
    fn test_extract_json_from_code_fence() {
        let text = format!("Here you go:\n```json\n{}\n```\nDone.", minimal_payload_json());
        let value = extract_json_payload(&text).unwrap();
        assert_eq!(value["classification"]["project"], "demo");
    }

    #[test]
    fn test_extract_json_from_raw_text() {
        let text = format!("Some preamble {} trailing words", minimal_payload_json());
        let value = extract_json_payload(&text).unwrap();
        assert_eq!(value["content"]["outcome"], "completed");
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let text = r#"{"content": {"summary": "has a } brace", "outcome": "partial"}, "classification": {"type": "other", "project": "p"}}"#;
        let value = extract_json_payload(text).unwrap();
        assert_eq!(value["content"]["summary"], "has a } brace");
    }

    #[test]
    fn test_extract_json_none_when_absent() {
        assert!(extract_json_payload("no json here").is_none());
    }

    #[test]
    fn test_validate_analyzer_response_ok() {
        let payload = validate_analyzer_response(minimal_payload_json()).unwrap();
        assert_eq!(payload.classification.node_type, NodeType::Feature);
        assert_eq!(payload.content.outcome, OutcomeKind::Completed);
        assert!(payload.lessons.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_outcome() {
        let text = r#"{
            "classification": {"type": "feature", "project": "demo"},
            "content": {"summary": "x", "outcome": "victorious"}
        }"#;
        let err = validate_analyzer_response(text).unwrap_err();
        assert!(matches!(err, NodeValidationError::InvalidField { .. }));
    }

    #[test]
    fn test_validate_rejects_missing_content() {
        let text = r#"{"classification": {"type": "feature", "project": "demo"}}"#;
        let err = validate_analyzer_response(text).unwrap_err();
        assert!(matches!(err, NodeValidationError::MissingField { field } if field == "content"));
    }

    #[test]
    fn test_validate_rejects_empty_summary() {
        let text = r#"{
            "classification": {"type": "feature", "project": "demo"},
            "content": {"summary": "   ", "outcome": "completed"}
        }"#;
        let err = validate_analyzer_response(text).unwrap_err();
        assert!(
            matches!(err, NodeValidationError::InvalidField { ref field, .. } if field == "content.summary")
        );
    }

    #[test]
    fn test_validate_no_json() {
        let err = validate_analyzer_response("I could not analyze this.").unwrap_err();
        assert!(matches!(err, NodeValidationError::NoJsonFound));
    }

    // ========================================================================
    // Edges
    // ========================================================================

    #[test]
    fn test_edge_kind_round_trip() {
        for kind in [
            EdgeKind::Branch,
            EdgeKind::TreeJump,
            EdgeKind::Compaction,
            EdgeKind::Resume,
            EdgeKind::Fork,
            EdgeKind::Predecessor,
            EdgeKind::SemanticRelated,
            EdgeKind::References,
            EdgeKind::LessonReinforces,
        ] {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse("unknown"), None);
    }

    #[test]
    fn test_edge_kind_structural_split() {
        assert!(EdgeKind::Fork.is_structural());
        assert!(EdgeKind::Compaction.is_structural());
        assert!(!EdgeKind::SemanticRelated.is_structural());
        assert!(!EdgeKind::LessonReinforces.is_structural());
    }
}
