// crates/core/src/prompt.rs
//! Prompt content hashing and version identity.
//!
//! A prompt version is identified by `v{n}-{hash8}` where the hash is taken
//! over the normalized prompt text, so cosmetic edits (whitespace, HTML
//! comments) never mint a new version.

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Normalize prompt text: trim, strip HTML comments, collapse whitespace.
pub fn normalize_prompt(text: &str) -> String {
    let comment_re = Regex::new(r"(?s)<!--.*?-->").expect("static regex compiles");
    let stripped = comment_re.replace_all(text.trim(), "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 prefix (8 hex chars) of the normalized prompt.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_prompt(text);
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Version label `v{n}-{hash8}`.
pub fn version_label(sequential: i64, hash: &str) -> String {
    format!("v{sequential}-{hash}")
}

/// One registered version of an analyzer prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVersion {
    /// `v{n}-{hash8}`.
    pub version: String,
    pub sequential: i64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub file_path: String,
}

/// Measured effect of a prompt version on one insight's occurrence rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEffectiveness {
    pub id: String,
    pub insight_id: String,
    pub prompt_version: String,
    pub before: EffectivenessWindow,
    pub after: EffectivenessWindow,
    pub improvement_pct: f64,
    pub statistically_significant: bool,
    pub sessions_before: i64,
    pub sessions_after: i64,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivenessWindow {
    pub occurrences: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
