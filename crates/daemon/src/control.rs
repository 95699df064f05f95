// crates/daemon/src/control.rs
//! Control plane: daemon lifecycle, shared context and event broadcast.
//!
//! Start order matters: integrity check + migrations happen when the store
//! opens, stale leases are released before any worker may lease, the default
//! prompt is installed and registered, then watcher, scheduler and workers
//! come up. Shutdown stops intake, drains workers to a deadline (held jobs
//! are released, not failed) and checkpoints the WAL.

use crate::analyzer::Analyzer;
use crate::embedder::{embedder_from_config, Embedder};
use crate::scheduler::Scheduler;
use crate::watcher::{SessionWatcher, WatchEvent};
use crate::worker::WorkerPool;
use crate::ANALYZER_PROMPT_NAME;
use chrono::{DateTime, Utc};
use pi_brain_core::job::{NewJob, Priority};
use pi_brain_core::session::read_session_header;
use pi_brain_core::Config;
use pi_brain_db::{Database, QueueDepths, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default analyzer prompt installed on first start.
pub const DEFAULT_ANALYZER_PROMPT: &str = r#"# Session analyzer

You are given one segment of a coding-agent session. Produce a single JSON
object describing the knowledge in it, with these top-level keys:

- `classification`: `type` (feature|bugfix|refactor|exploration|planning|other),
  `project`, `isNewProject`, `hadClearGoal`
- `content`: `summary`, `outcome` (completed|partial|abandoned|blocked),
  `keyDecisions`, `filesTouched`, `toolsUsed`, `errorsSeen`
- `lessons`: lists keyed by `project`, `task`, `user`, `model`, `tool`,
  `skill`, `subagent`
- `observations`: `modelsUsed`, `promptingWins`, `promptingFailures`,
  `modelQuirks`, `toolUseErrors`
- `semantic`: `tags`, `topics`

Respond with only the JSON object, optionally in a ```json fence.
"#;

/// Frame broadcast to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BrainEvent {
    pub fn node_created(node: &pi_brain_core::Node) -> Self {
        Self {
            event_type: "node.created".to_string(),
            data: serde_json::to_value(node).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn analysis_completed(node_id: &str, session_file: &str) -> Self {
        Self {
            event_type: "analysis.completed".to_string(),
            data: serde_json::json!({ "nodeId": node_id, "sessionFile": session_file }),
            timestamp: Utc::now(),
        }
    }

    pub fn daemon_status(status: &DaemonStatus) -> Self {
        Self {
            event_type: "daemon.status".to_string(),
            data: serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }
}

/// Shared handle threaded through workers, scheduler and maintenance jobs.
pub struct Context {
    pub db: Database,
    pub config: Config,
    pub analyzer: Arc<dyn Analyzer>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub events: broadcast::Sender<BrainEvent>,
    pub prompts_dir: PathBuf,
    pub computer: String,
}

impl Context {
    pub fn broadcast(&self, event: BrainEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] pi_brain_core::ConfigError),

    #[error("Watcher failed to start: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Invalid cron expression for {key}: {expression}")]
    InvalidCron { key: String, expression: String },
}

/// Daemon status exposed on `/daemon/status` and in periodic broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub workers: usize,
    pub analyzer_available: bool,
    pub embedder_configured: bool,
    pub queue: QueueDepths,
    pub recent_analyses: Vec<serde_json::Value>,
    pub next_scheduled_runs: Vec<ScheduledRun>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRun {
    pub job_name: String,
    pub next_run: Option<DateTime<Utc>>,
}

/// The running daemon: watcher + queue pump + workers + scheduler.
pub struct Daemon {
    context: Arc<Context>,
    token: CancellationToken,
    watcher: Option<SessionWatcher>,
    workers: WorkerPool,
    scheduler: Scheduler,
    pump: tokio::task::JoinHandle<()>,
    status_task: tokio::task::JoinHandle<()>,
    started_at: DateTime<Utc>,
    analyzer_available: bool,
}

impl Daemon {
    /// Bring the daemon up. The database must already be open (integrity
    /// checked and migrated at open time).
    pub async fn start(
        config: Config,
        db: Database,
        analyzer: Arc<dyn Analyzer>,
    ) -> Result<Self, DaemonError> {
        let now = Utc::now();

        // Validate schedules before anything runs.
        for (key, expression) in config.schedules() {
            if !crate::scheduler::is_valid_cron_expression(expression) {
                return Err(DaemonError::InvalidCron {
                    key: key.to_string(),
                    expression: expression.to_string(),
                });
            }
        }

        // Stale leases from a previous crash go back to pending before any
        // worker may lease.
        db.release_stale(now).await?;

        // Install + register the analyzer prompt so every node can reference
        // an existing PromptVersion.
        let prompts_dir = pi_brain_core::paths::prompts_dir().ok_or(StoreError::NoDataDir)?;
        pi_brain_db::install_default_prompt(
            &prompts_dir,
            ANALYZER_PROMPT_NAME,
            DEFAULT_ANALYZER_PROMPT,
        )?;
        db.register_prompt(&prompts_dir, ANALYZER_PROMPT_NAME, now).await?;

        let analyzer_available = match analyzer.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "analyzer unavailable; workers will idle until it appears");
                false
            }
        };

        let embedder: Option<Arc<dyn Embedder>> =
            embedder_from_config(&config.daemon).map(Arc::from);
        if embedder.is_none() {
            info!("no embedding provider configured; semantic features disabled");
        }

        let (events, _) = broadcast::channel(256);
        let computer = hostname();
        let context = Arc::new(Context {
            db,
            config,
            analyzer,
            embedder,
            events,
            prompts_dir,
            computer,
        });

        let token = CancellationToken::new();

        // Watcher → queue pump.
        let sessions_dir = context.config.sessions_dir()?;
        let (watcher, watch_rx) = SessionWatcher::start(
            &[sessions_dir],
            Duration::from_secs(2),
            Duration::from_secs(context.config.daemon.idle_timeout_minutes * 60),
            token.clone(),
        )?;
        let pump = tokio::spawn(pump_watch_events(context.clone(), watch_rx, token.clone()));

        // Backlog: sessions that appeared while the daemon was down never
        // fire an idle event, so scan once and enqueue the unanalyzed ones.
        {
            let context = context.clone();
            let sessions_dir = context.config.sessions_dir()?;
            tokio::spawn(async move {
                for path in crate::watcher::initial_scan(&[sessions_dir]) {
                    let session_file = path.to_string_lossy().into_owned();
                    match context.db.session_file_has_nodes(&session_file).await {
                        Ok(true) => continue,
                        Ok(false) => {
                            let job = NewJob::initial(&session_file);
                            let max = context.config.daemon.max_queue_size;
                            if let Err(e) = context.db.enqueue(&job, Utc::now(), max).await {
                                warn!(error = %e, "backlog enqueue failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "backlog lookup failed"),
                    }
                }
            });
        }

        let workers = WorkerPool::spawn(context.clone(), token.clone());
        let scheduler = Scheduler::spawn(context.clone(), token.clone())?;

        // Periodic daemon.status broadcast.
        let status_context = context.clone();
        let status_token = token.clone();
        let status_scheduler_runs = scheduler.next_runs();
        let status_started = now;
        let worker_count = status_context.config.daemon.parallel_workers;
        let status_analyzer_available = analyzer_available;
        let status_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = status_token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Ok(queue) = status_context.db.queue_depths().await {
                            let status = DaemonStatus {
                                running: true,
                                workers: worker_count,
                                analyzer_available: status_analyzer_available,
                                embedder_configured: status_context.embedder.is_some(),
                                queue,
                                recent_analyses: Vec::new(),
                                next_scheduled_runs: status_scheduler_runs.clone(),
                                started_at: status_started,
                            };
                            status_context.broadcast(BrainEvent::daemon_status(&status));
                        }
                    }
                }
            }
        });

        info!("daemon started");
        Ok(Self {
            context,
            token,
            watcher: Some(watcher),
            workers,
            scheduler,
            pump,
            status_task,
            started_at: now,
            analyzer_available,
        })
    }

    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    /// Subscribe to broadcast events (WS surface).
    pub fn subscribe(&self) -> broadcast::Receiver<BrainEvent> {
        self.context.events.subscribe()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> Result<DaemonStatus, StoreError> {
        let queue = self.context.db.queue_depths().await?;
        let recent = self
            .context
            .db
            .list_jobs(Some(pi_brain_core::JobState::Completed), 10)
            .await?
            .into_iter()
            .map(|job| serde_json::to_value(job).unwrap_or(serde_json::Value::Null))
            .collect();
        Ok(DaemonStatus {
            running: !self.token.is_cancelled(),
            workers: self.context.config.daemon.parallel_workers,
            analyzer_available: self.analyzer_available,
            embedder_configured: self.context.embedder.is_some(),
            queue,
            recent_analyses: recent,
            next_scheduled_runs: self.scheduler.next_runs(),
            started_at: self.started_at,
        })
    }

    /// Graceful shutdown: stop intake, drain workers up to the deadline,
    /// checkpoint the WAL. Held jobs are released by their workers.
    pub async fn shutdown(mut self, deadline: Duration) {
        info!("daemon shutting down");
        self.token.cancel();

        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        let _ = self.pump.await;
        let _ = self.status_task.await;

        if tokio::time::timeout(deadline, self.workers.join())
            .await
            .is_err()
        {
            warn!("workers did not drain before deadline");
        }
        self.scheduler.join().await;

        if let Err(e) = self.context.db.checkpoint().await {
            warn!(error = %e, "WAL checkpoint on shutdown failed");
        }
        info!("daemon stopped");
    }
}

/// Turn watcher events into queue entries. Idle sessions get an `initial`
/// job; forked sessions (header has `parentSession`) jump the line with the
/// fork priority. Enqueue deduplication lives in the store.
async fn pump_watch_events(
    context: Arc<Context>,
    mut rx: tokio::sync::mpsc::Receiver<WatchEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    WatchEvent::SessionChanged(path) => {
                        tracing::debug!(path = %path.display(), "session changed");
                    }
                    WatchEvent::SessionIdle(path) => {
                        let session_file = path.to_string_lossy().into_owned();
                        let mut job = NewJob::initial(&session_file);
                        if let Ok(header) = read_session_header(&path).await {
                            if header.parent_session.is_some() {
                                job = job.with_priority(Priority::FORK);
                            }
                        }
                        let max = context.config.daemon.max_queue_size;
                        match context.db.enqueue(&job, Utc::now(), max).await {
                            Ok(Some(id)) => {
                                info!(job_id = id, path = %path.display(), "enqueued analysis for idle session");
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to enqueue idle session"),
                        }
                    }
                }
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "hub".to_string())
}
