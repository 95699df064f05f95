// crates/core/src/paths.rs
//! Filesystem layout helpers for `~/.pi-brain`.

use std::path::{Path, PathBuf};

/// Root data directory: `~/.pi-brain`.
pub fn brain_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pi-brain"))
}

/// Config file path: `~/.pi-brain/config.yaml`.
pub fn config_path() -> Option<PathBuf> {
    brain_home().map(|p| p.join("config.yaml"))
}

/// Database file path: `~/.pi-brain/data/brain.db`.
pub fn db_path() -> Option<PathBuf> {
    brain_home().map(|p| p.join("data").join("brain.db"))
}

/// Node artifact root: `~/.pi-brain/data/nodes`.
pub fn nodes_dir() -> Option<PathBuf> {
    brain_home().map(|p| p.join("data").join("nodes"))
}

/// Prompt directory: `~/.pi-brain/prompts`.
pub fn prompts_dir() -> Option<PathBuf> {
    brain_home().map(|p| p.join("prompts"))
}

/// Default watched sessions directory: `~/.pi/agent/sessions`.
pub fn default_sessions_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pi").join("agent").join("sessions"))
}

/// Artifact path for one node version, relative to a nodes root.
///
/// Layout: `<nodes_root>/YYYY/MM/<id>-v<version>.json`, where YYYY/MM come
/// from the node's analysis timestamp.
pub fn node_artifact_path(
    nodes_root: &Path,
    id: &str,
    version: i64,
    analyzed_at: chrono::DateTime<chrono::Utc>,
) -> PathBuf {
    use chrono::Datelike;
    nodes_root
        .join(format!("{:04}", analyzed_at.year()))
        .join(format!("{:02}", analyzed_at.month()))
        .join(format!("{id}-v{version}.json"))
}

/// Expand a leading `~` or `~/` in a path string against the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
