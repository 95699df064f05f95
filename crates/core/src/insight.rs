// crates/core/src/insight.rs
//! Aggregated insights and clusters: recurring observations across nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of recurring observation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Quirk,
    Win,
    Failure,
    ToolError,
    Lesson,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Quirk => "quirk",
            InsightType::Win => "win",
            InsightType::Failure => "failure",
            InsightType::ToolError => "tool_error",
            InsightType::Lesson => "lesson",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quirk" => Some(InsightType::Quirk),
            "win" => Some(InsightType::Win),
            "failure" => Some(InsightType::Failure),
            "tool_error" => Some(InsightType::ToolError),
            "lesson" => Some(InsightType::Lesson),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

/// A recurring observation aggregated across nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedInsight {
    pub id: String,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub pattern: String,
    pub frequency: i64,
    pub confidence: f64,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workaround: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub prompt_included: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
}

/// Normalize a raw pattern string for grouping: lowercase, collapse
/// whitespace, trim trailing punctuation.
pub fn normalize_pattern(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', ',', ';', ':'])
        .to_string()
}

/// Deterministic insight id from its grouping key.
pub fn insight_id(
    insight_type: InsightType,
    model: Option<&str>,
    tool: Option<&str>,
    normalized_pattern: &str,
) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in [
        insight_type.as_str(),
        model.unwrap_or(""),
        tool.unwrap_or(""),
        normalized_pattern,
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ============================================================================
// Clusters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Friction,
    Delight,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Friction => "friction",
            SignalType::Delight => "delight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "friction" => Some(SignalType::Friction),
            "delight" => Some(SignalType::Delight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Pending,
    Confirmed,
    Dismissed,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Confirmed => "confirmed",
            ClusterStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ClusterStatus::Pending),
            "confirmed" => Some(ClusterStatus::Confirmed),
            "dismissed" => Some(ClusterStatus::Dismissed),
            _ => None,
        }
    }
}

/// A group of nodes/patterns aggregated by vector similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub node_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<SignalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_model: Option<String>,
    pub status: ClusterStatus,
    pub algorithm: String,
    pub min_cluster_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Vec<f32>>,
}
