// crates/db/src/nodes.rs
//! Node repository: upsert with version retention, filtered listing, and
//! graph traversal.
//!
//! The `nodes` table holds the latest version of each node flattened for
//! query, plus the full nested JSON; `node_versions` retains every version.
//! `source.*` fields are written on INSERT only — reanalysis can change what
//! a node says, never where it came from.

use crate::{artifacts, fts, retry_busy, Database, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use pi_brain_core::node::Node;
#[cfg(test)]
use pi_brain_core::node::NodeSource;
use pi_brain_core::EdgeKind;
use serde::Serialize;
use sqlx::Row;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Result of an upsert: the stored node (authoritative version + source)
/// and whether anything changed.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub node: Node,
    pub created: bool,
    pub changed: bool,
}

/// Filters for node listing. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub project: Option<String>,
    pub node_type: Option<String>,
    pub outcome: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub tag: Option<String>,
    pub topic: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub sort: NodeSort,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeSort {
    #[default]
    Timestamp,
    AnalyzedAt,
    Project,
}

impl NodeSort {
    fn column(&self) -> &'static str {
        match self {
            NodeSort::Timestamp => "timestamp",
            NodeSort::AnalyzedAt => "analyzed_at",
            NodeSort::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp" => Some(NodeSort::Timestamp),
            "analyzedAt" => Some(NodeSort::AnalyzedAt),
            "project" => Some(NodeSort::Project),
            _ => None,
        }
    }
}

/// The analysis-derived parts of a node, used to decide whether a reanalysis
/// actually changed anything. Source and version are deliberately excluded.
#[derive(Serialize)]
struct AnalysisFingerprint<'a> {
    classification: &'a pi_brain_core::node::Classification,
    content: &'a pi_brain_core::node::Content,
    lessons: &'a pi_brain_core::node::Lessons,
    observations: &'a pi_brain_core::node::Observations,
    semantic: &'a pi_brain_core::node::Semantic,
    signals: &'a pi_brain_core::node::Signals,
    daemon_meta: &'a pi_brain_core::node::DaemonMeta,
    analyzer_version: &'a str,
}

fn fingerprint(node: &Node) -> StoreResult<String> {
    serde_json::to_string(&AnalysisFingerprint {
        classification: &node.classification,
        content: &node.content,
        lessons: &node.lessons,
        observations: &node.observations,
        semantic: &node.semantic,
        signals: &node.signals,
        daemon_meta: &node.daemon_meta,
        analyzer_version: &node.metadata.analyzer_version,
    })
    .map_err(|e| StoreError::Serialize {
        what: "node fingerprint",
        source: e,
    })
}

impl Database {
    /// Insert or update a node, retaining prior versions.
    ///
    /// Idempotent: upserting an identical node leaves the row untouched and
    /// the version unchanged. A changed analysis bumps the version and keeps
    /// the previous one in `node_versions`. Source fields are never
    /// overwritten after the initial insert.
    pub async fn upsert_node(&self, node: &Node) -> StoreResult<UpsertOutcome> {
        let node = node.clone();
        retry_busy(|| {
            let node = node.clone();
            async move { self.upsert_node_inner(node).await }
        })
        .await
    }

    async fn upsert_node_inner(&self, mut node: Node) -> StoreResult<UpsertOutcome> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query("SELECT version, node_json FROM nodes WHERE id = ?")
            .bind(&node.id)
            .fetch_optional(&mut *tx)
            .await?;

        let (created, changed) = match existing {
            None => {
                node.version = 1;
                (true, true)
            }
            Some(row) => {
                let existing_version: i64 = row.try_get("version")?;
                let existing_json: String = row.try_get("node_json")?;
                let existing_node: Node =
                    serde_json::from_str(&existing_json).map_err(|e| StoreError::Serialize {
                        what: "stored node",
                        source: e,
                    })?;

                // Source is immutable after insert.
                node.source = existing_node.source.clone();

                if fingerprint(&node)? == fingerprint(&existing_node)? {
                    node.version = existing_version;
                    (false, false)
                } else {
                    node.version = existing_version + 1;
                    (false, true)
                }
            }
        };

        if !changed {
            tx.rollback().await?;
            return Ok(UpsertOutcome {
                node,
                created,
                changed,
            });
        }

        let now = Utc::now().timestamp();
        let node_json = serde_json::to_string(&node).map_err(|e| StoreError::Serialize {
            what: "node",
            source: e,
        })?;
        let segment_json =
            serde_json::to_string(&node.source.segment).map_err(|e| StoreError::Serialize {
                what: "segment",
                source: e,
            })?;
        let tags = serde_json::to_string(&node.semantic.tags).unwrap_or_else(|_| "[]".into());
        let topics = serde_json::to_string(&node.semantic.topics).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            r#"
INSERT INTO nodes (
    id, version, session_file, segment_json, session_id, computer,
    node_type, project, summary, outcome, timestamp, analyzed_at,
    analyzer_version, tags, topics, friction_score, delight_score,
    node_json, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    version = excluded.version,
    node_type = excluded.node_type,
    project = excluded.project,
    summary = excluded.summary,
    outcome = excluded.outcome,
    timestamp = excluded.timestamp,
    analyzed_at = excluded.analyzed_at,
    analyzer_version = excluded.analyzer_version,
    tags = excluded.tags,
    topics = excluded.topics,
    friction_score = excluded.friction_score,
    delight_score = excluded.delight_score,
    node_json = excluded.node_json,
    updated_at = excluded.updated_at
"#,
        )
        .bind(&node.id)
        .bind(node.version)
        .bind(&node.source.session_file)
        .bind(&segment_json)
        .bind(&node.source.session_id)
        .bind(&node.source.computer)
        .bind(node.classification.node_type.as_str())
        .bind(&node.classification.project)
        .bind(&node.content.summary)
        .bind(node.content.outcome.as_str())
        .bind(node.metadata.timestamp.timestamp())
        .bind(node.metadata.analyzed_at.timestamp())
        .bind(&node.metadata.analyzer_version)
        .bind(&tags)
        .bind(&topics)
        .bind(node.signals.friction.score)
        .bind(node.signals.delight.score)
        .bind(&node_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO node_versions (id, version, node_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&node.id)
        .bind(node.version)
        .bind(&node_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Denormalized observation rows for aggregation.
        for table in ["lessons", "model_quirks", "tool_errors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE node_id = ?"))
                .bind(&node.id)
                .execute(&mut *tx)
                .await?;
        }
        for (level, texts) in [
            ("project", &node.lessons.project),
            ("task", &node.lessons.task),
            ("user", &node.lessons.user),
            ("model", &node.lessons.model),
            ("tool", &node.lessons.tool),
            ("skill", &node.lessons.skill),
            ("subagent", &node.lessons.subagent),
        ] {
            for text in texts {
                sqlx::query("INSERT INTO lessons (node_id, level, text) VALUES (?, ?, ?)")
                    .bind(&node.id)
                    .bind(level)
                    .bind(text)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        let primary_model = node.observations.models_used.first().cloned();
        for quirk in &node.observations.model_quirks {
            sqlx::query("INSERT INTO model_quirks (node_id, model, text) VALUES (?, ?, ?)")
                .bind(&node.id)
                .bind(&primary_model)
                .bind(quirk)
                .execute(&mut *tx)
                .await?;
        }
        let primary_tool = node.content.tools_used.first().cloned();
        for error in &node.observations.tool_use_errors {
            sqlx::query("INSERT INTO tool_errors (node_id, tool, text) VALUES (?, ?, ?)")
                .bind(&node.id)
                .bind(&primary_tool)
                .bind(error)
                .execute(&mut *tx)
                .await?;
        }

        fts::index_for_search(&mut tx, &node).await?;

        tx.commit().await?;

        if let Some(nodes_dir) = self.nodes_dir() {
            artifacts::write_node_artifact(nodes_dir, &node)?;
        }

        debug!(node_id = %node.id, version = node.version, created, "node upserted");
        Ok(UpsertOutcome {
            node,
            created,
            changed,
        })
    }

    /// Fetch the latest version of a node.
    pub async fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        let row = sqlx::query("SELECT node_json FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let json: String = r.try_get("node_json")?;
            serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                what: "stored node",
                source: e,
            })
        })
        .transpose()
    }

    /// Fetch a specific retained version.
    pub async fn get_node_version(&self, id: &str, version: i64) -> StoreResult<Option<Node>> {
        let row = sqlx::query("SELECT node_json FROM node_versions WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let json: String = r.try_get("node_json")?;
            serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                what: "stored node version",
                source: e,
            })
        })
        .transpose()
    }

    /// All retained version numbers of a node, ascending.
    pub async fn list_node_versions(&self, id: &str) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM node_versions WHERE id = ? ORDER BY version")
            .bind(id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(|r| Ok(r.try_get("version")?)).collect()
    }

    /// Filtered listing of latest-version nodes, nested shape.
    pub async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        enum Bind {
            Text(String),
            Int(i64),
        }

        let mut sql = String::from("SELECT node_json FROM nodes WHERE 1=1");
        let mut binds: Vec<Bind> = Vec::new();

        if let Some(project) = &filter.project {
            sql.push_str(" AND project = ?");
            binds.push(Bind::Text(project.clone()));
        }
        if let Some(node_type) = &filter.node_type {
            sql.push_str(" AND node_type = ?");
            binds.push(Bind::Text(node_type.clone()));
        }
        if let Some(outcome) = &filter.outcome {
            sql.push_str(" AND outcome = ?");
            binds.push(Bind::Text(outcome.clone()));
        }
        if let Some(from) = &filter.from {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Bind::Int(from.timestamp()));
        }
        if let Some(to) = &filter.to {
            sql.push_str(" AND timestamp <= ?");
            binds.push(Bind::Int(to.timestamp()));
        }
        // Tags/topics are stored as JSON arrays; match the quoted element.
        if let Some(tag) = &filter.tag {
            sql.push_str(" AND tags LIKE ?");
            binds.push(Bind::Text(format!("%\"{}\"%", tag.replace('%', ""))));
        }
        if let Some(topic) = &filter.topic {
            sql.push_str(" AND topics LIKE ?");
            binds.push(Bind::Text(format!("%\"{}\"%", topic.replace('%', ""))));
        }

        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ? OFFSET ?",
            filter.sort.column(),
            if filter.descending { "DESC" } else { "ASC" }
        ));

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Text(text) => query.bind(text),
                Bind::Int(value) => query.bind(value),
            };
        }
        let limit = if filter.limit <= 0 { 50 } else { filter.limit };
        query = query.bind(limit).bind(filter.offset.max(0));

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter()
            .map(|r| {
                let json: String = r.try_get("node_json")?;
                serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    what: "stored node",
                    source: e,
                })
            })
            .collect()
    }

    /// Latest nodes of one session, ascending by segment timestamp.
    pub async fn nodes_for_session(&self, session_id: &str) -> StoreResult<Vec<Node>> {
        let rows =
            sqlx::query("SELECT node_json FROM nodes WHERE session_id = ? ORDER BY timestamp ASC")
                .bind(session_id)
                .fetch_all(self.pool())
                .await?;
        rows.iter()
            .map(|r| {
                let json: String = r.try_get("node_json")?;
                serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    what: "stored node",
                    source: e,
                })
            })
            .collect()
    }

    /// The most recent node for a project other than `exclude_id`, used for
    /// predecessor edges and abandoned-restart detection.
    pub async fn latest_node_for_project(
        &self,
        project: &str,
        exclude_id: &str,
    ) -> StoreResult<Option<Node>> {
        let row = sqlx::query(
            "SELECT node_json FROM nodes WHERE project = ? AND id != ? ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(project)
        .bind(exclude_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| {
            let json: String = r.try_get("node_json")?;
            serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                what: "stored node",
                source: e,
            })
        })
        .transpose()
    }

    /// Last node (by timestamp) of one session, for fork edges.
    pub async fn last_node_of_session(&self, session_id: &str) -> StoreResult<Option<Node>> {
        let row = sqlx::query(
            "SELECT node_json FROM nodes WHERE session_id = ? ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| {
            let json: String = r.try_get("node_json")?;
            serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                what: "stored node",
                source: e,
            })
        })
        .transpose()
    }

    /// Node ids whose analyzer version differs from `current`, oldest first.
    /// Candidates for reanalysis.
    pub async fn nodes_with_outdated_analysis(
        &self,
        current_version: &str,
        limit: i64,
    ) -> StoreResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT id, session_file FROM nodes WHERE analyzer_version != ? ORDER BY analyzed_at ASC LIMIT ?",
        )
        .bind(current_version)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("id")?, r.try_get("session_file")?)))
            .collect()
    }

    /// Nodes analyzed since `since`, for connection discovery.
    pub async fn nodes_touched_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT node_json FROM nodes WHERE analyzed_at >= ? ORDER BY analyzed_at ASC",
        )
        .bind(since.timestamp())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| {
                let json: String = r.try_get("node_json")?;
                serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    what: "stored node",
                    source: e,
                })
            })
            .collect()
    }

    /// Nodes whose segment timestamp falls in `[from, to)`, used by the
    /// effectiveness windows.
    pub async fn nodes_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT node_json FROM nodes WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp ASC",
        )
        .bind(from.timestamp())
        .bind(to.timestamp())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| {
                let json: String = r.try_get("node_json")?;
                serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    what: "stored node",
                    source: e,
                })
            })
            .collect()
    }

    /// Every latest-version node. The store is local and single-user, so a
    /// full scan is the honest implementation for batch aggregation.
    pub async fn all_nodes(&self) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query("SELECT node_json FROM nodes ORDER BY timestamp ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|r| {
                let json: String = r.try_get("node_json")?;
                serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    what: "stored node",
                    source: e,
                })
            })
            .collect()
    }

    /// Node ids sharing a lesson whose normalized text matches, oldest first.
    pub async fn nodes_with_lesson(&self, normalized_text: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
SELECT DISTINCT l.node_id
FROM lessons l
JOIN nodes n ON n.id = l.node_id
WHERE LOWER(TRIM(l.text)) = ?
ORDER BY n.timestamp ASC
"#,
        )
        .bind(normalized_text)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|r| r.get("node_id")).collect())
    }

    /// Whether any node was ever derived from this session file, used to
    /// decide if a startup backlog scan should enqueue it.
    pub async fn session_file_has_nodes(&self, session_file: &str) -> StoreResult<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE session_file = ?")
            .bind(session_file)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0 > 0)
    }

    /// Distinct projects with node counts, for the sessions listing.
    pub async fn project_groups(&self) -> StoreResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT project, COUNT(*) AS n FROM nodes GROUP BY project ORDER BY n DESC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("project")?, r.try_get("n")?)))
            .collect()
    }

    // ========================================================================
    // Graph traversal
    // ========================================================================

    /// Direct neighbors of a node via edges of the given kinds (either
    /// direction). Empty `kinds` means all kinds.
    pub async fn neighbors(
        &self,
        node_id: &str,
        kinds: &[EdgeKind],
    ) -> StoreResult<Vec<(pi_brain_core::Edge, Node)>> {
        let edges = self.edges_touching(node_id, kinds).await?;
        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            let other = if edge.from_node_id == node_id {
                &edge.to_node_id
            } else {
                &edge.from_node_id
            };
            if let Some(node) = self.get_node(other).await? {
                out.push((edge, node));
            }
        }
        Ok(out)
    }

    /// Bounded breadth-first traversal from a node. Returns the visited node
    /// ids (excluding the start) in discovery order.
    pub async fn traverse(
        &self,
        start: &str,
        kinds: &[EdgeKind],
        max_depth: usize,
    ) -> StoreResult<Vec<String>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());
        let mut out = Vec::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((start.to_string(), 0));

        while let Some((id, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.edges_touching(&id, kinds).await? {
                let other = if edge.from_node_id == id {
                    edge.to_node_id
                } else {
                    edge.from_node_id
                };
                if visited.insert(other.clone()) {
                    out.push(other.clone());
                    frontier.push_back((other, depth + 1));
                }
            }
        }
        Ok(out)
    }

}

// Keep the immutable-source contract visible to tests.
#[cfg(test)]
pub(crate) fn source_of(node: &Node) -> &NodeSource {
    &node.source
}
