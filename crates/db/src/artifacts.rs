// crates/db/src/artifacts.rs
//! JSON node artifacts on disk.
//!
//! Every node version is written as a standalone JSON file under
//! `<nodes_dir>/YYYY/MM/<id>-v<version>.json`. Writes go to a temp file in
//! the target directory and are renamed into place, so readers never see a
//! partial artifact.

use crate::{StoreError, StoreResult};
use pi_brain_core::node::Node;
use pi_brain_core::paths::node_artifact_path;
use std::path::{Path, PathBuf};

/// Write a node artifact atomically. Returns the final path.
pub fn write_node_artifact(nodes_dir: &Path, node: &Node) -> StoreResult<PathBuf> {
    let path = node_artifact_path(nodes_dir, &node.id, node.version, node.metadata.analyzed_at);
    let parent = path.parent().expect("artifact path has a parent");
    std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
        path: parent.to_owned(),
        source: e,
    })?;

    let json = serde_json::to_vec_pretty(node).map_err(|e| StoreError::Serialize {
        what: "node artifact",
        source: e,
    })?;

    let tmp = parent.join(format!(".{}-v{}.json.tmp", node.id, node.version));
    std::fs::write(&tmp, &json).map_err(|e| StoreError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}

/// Read a node artifact back.
pub fn read_node_artifact(path: &Path) -> StoreResult<Node> {
    let raw = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
        path: path.to_owned(),
        source: e,
    })?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Serialize {
        what: "node artifact",
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_brain_core::boundary::Segment;
    use pi_brain_core::node::*;
    use chrono::TimeZone;

    fn sample_node() -> Node {
        let ts = chrono::Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).unwrap();
        Node {
            id: "deadbeef00000001".to_string(),
            version: 1,
            source: NodeSource {
                session_file: "s.jsonl".to_string(),
                segment: Segment {
                    session_file: "s.jsonl".to_string(),
                    start_entry_id: "e1".to_string(),
                    end_entry_id: "e2".to_string(),
                    entry_count: 2,
                    start_boundaries: vec![],
                    end_boundaries: vec![],
                },
                session_id: "s".to_string(),
                computer: "hub".to_string(),
            },
            classification: Classification {
                node_type: NodeType::Other,
                project: "p".to_string(),
                is_new_project: false,
                had_clear_goal: false,
            },
            content: Content {
                summary: "sum".to_string(),
                outcome: OutcomeKind::Partial,
                key_decisions: vec![],
                files_touched: vec![],
                tools_used: vec![],
                errors_seen: vec![],
            },
            lessons: Default::default(),
            observations: Default::default(),
            metadata: NodeMetadata {
                tokens_used: 0,
                cost: 0.0,
                duration_minutes: 0.0,
                timestamp: ts,
                analyzed_at: ts,
                analyzer_version: "v1-aaaa1111".to_string(),
            },
            semantic: Default::default(),
            signals: Default::default(),
            daemon_meta: Default::default(),
        }
    }

    #[test]
    fn test_write_and_read_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let node = sample_node();
        let path = write_node_artifact(dir.path(), &node).unwrap();

        assert!(path.ends_with("2026/04/deadbeef00000001-v1.json"));
        let back = read_node_artifact(&path).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let node = sample_node();
        let path = write_node_artifact(dir.path(), &node).unwrap();
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1, "only the final artifact remains: {entries:?}");
    }

    #[test]
    fn test_new_version_is_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = sample_node();
        write_node_artifact(dir.path(), &node).unwrap();
        node.version = 2;
        let v2 = write_node_artifact(dir.path(), &node).unwrap();
        assert!(v2.ends_with("deadbeef00000001-v2.json"));
        let parent = v2.parent().unwrap();
        assert_eq!(std::fs::read_dir(parent).unwrap().count(), 2);
    }
}
