// crates/server/src/state.rs
//! Application state for the axum server.

use pi_brain_core::Config;
use pi_brain_daemon::{BrainEvent, Daemon, Embedder};
use pi_brain_db::Database;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Database handle for all reads and the write endpoints.
    pub db: Database,
    /// Live configuration; PUTs update it and persist to disk.
    ///
    /// `std::sync::RwLock` because the guard is never held across an await.
    pub config: RwLock<Config>,
    /// Where config updates are written; `None` disables persistence (tests).
    pub config_path: Option<PathBuf>,
    /// The running daemon, when the server supervises one. Taken at
    /// shutdown (Daemon::shutdown consumes it).
    pub daemon: tokio::sync::RwLock<Option<Daemon>>,
    /// Broadcast feed for `/ws` subscribers.
    pub events: broadcast::Sender<BrainEvent>,
    /// Embedder for query-side semantic search, when configured.
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl AppState {
    /// State for an API-only server (no daemon attached).
    pub fn new(db: Database, config: Config) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            start_time: Instant::now(),
            db,
            config: RwLock::new(config),
            config_path: None,
            daemon: tokio::sync::RwLock::new(None),
            events,
            embedder: None,
        })
    }

    /// State wrapping a running daemon; events and embedder are shared with
    /// it so `/ws` relays worker broadcasts.
    pub fn with_daemon(db: Database, config: Config, config_path: Option<PathBuf>, daemon: Daemon) -> Arc<Self> {
        let context = daemon.context();
        Arc::new(Self {
            start_time: Instant::now(),
            db,
            config: RwLock::new(config),
            config_path,
            events: context.events.clone(),
            embedder: context.embedder.clone(),
            daemon: tokio::sync::RwLock::new(Some(daemon)),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
