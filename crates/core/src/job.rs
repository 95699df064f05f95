// crates/core/src/job.rs
//! Analysis job model for the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue priorities; lower runs sooner.
pub struct Priority;

impl Priority {
    pub const USER_TRIGGERED: i64 = 10;
    pub const FORK: i64 = 50;
    pub const INITIAL: i64 = 100;
    pub const REANALYSIS: i64 = 200;
    pub const CONNECTION: i64 = 300;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Initial,
    Reanalysis,
    ConnectionDiscovery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initial => "initial",
            JobKind::Reanalysis => "reanalysis",
            JobKind::ConnectionDiscovery => "connection_discovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(JobKind::Initial),
            "reanalysis" => Some(JobKind::Reanalysis),
            "connection_discovery" => Some(JobKind::ConnectionDiscovery),
            _ => None,
        }
    }

    /// Default priority for jobs of this kind.
    pub fn default_priority(&self) -> i64 {
        match self {
            JobKind::Initial => Priority::INITIAL,
            JobKind::Reanalysis => Priority::REANALYSIS,
            JobKind::ConnectionDiscovery => Priority::CONNECTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// One durable queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub priority: i64,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_until: Option<DateTime<Utc>>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A job to be enqueued; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub session_file: Option<String>,
    pub node_id: Option<String>,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn initial(session_file: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Initial,
            session_file: Some(session_file.into()),
            node_id: None,
            priority: Priority::INITIAL,
            run_at: None,
        }
    }

    pub fn reanalysis(session_file: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Reanalysis,
            session_file: Some(session_file.into()),
            node_id: Some(node_id.into()),
            priority: Priority::REANALYSIS,
            run_at: None,
        }
    }

    pub fn connection_discovery() -> Self {
        Self {
            kind: JobKind::ConnectionDiscovery,
            session_file: None,
            node_id: None,
            priority: Priority::CONNECTION,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::USER_TRIGGERED < Priority::FORK);
        assert!(Priority::FORK < Priority::INITIAL);
        assert!(Priority::INITIAL < Priority::REANALYSIS);
        assert!(Priority::REANALYSIS < Priority::CONNECTION);
    }

    #[test]
    fn test_job_kind_round_trip() {
        for kind in [
            JobKind::Initial,
            JobKind::Reanalysis,
            JobKind::ConnectionDiscovery,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("nonsense"), None);
    }

    #[test]
    fn test_default_priorities() {
        assert_eq!(JobKind::Initial.default_priority(), 100);
        assert_eq!(JobKind::Reanalysis.default_priority(), 200);
        assert_eq!(JobKind::ConnectionDiscovery.default_priority(), 300);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_job_builders() {
        let job = NewJob::initial("s1.jsonl");
        assert_eq!(job.kind, JobKind::Initial);
        assert_eq!(job.priority, Priority::INITIAL);
        assert_eq!(job.session_file.as_deref(), Some("s1.jsonl"));

        let job = NewJob::initial("s1.jsonl").with_priority(Priority::FORK);
        assert_eq!(job.priority, Priority::FORK);

        let job = NewJob::reanalysis("s1.jsonl", "node-1");
        assert_eq!(job.node_id.as_deref(), Some("node-1"));
    }
}
