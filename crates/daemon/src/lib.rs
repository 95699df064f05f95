// crates/daemon/src/lib.rs
//! The pi-brain daemon: watcher, analysis workers, scheduler, maintenance
//! pipeline and control plane.
//!
//! The daemon prefers degraded operation to crashing: a missing embedder
//! disables semantic features but never blocks ingestion; a missing analyzer
//! idles the workers but keeps the API up.

pub mod analyzer;
pub mod control;
pub mod embedder;
pub mod maintenance;
pub mod promptgen;
pub mod scheduler;
pub mod search;
pub mod watcher;
pub mod worker;

pub use analyzer::{AnalyzeRequest, Analyzer, AnalyzerError, Capability, PiCliAnalyzer};
pub use control::{BrainEvent, Daemon, DaemonStatus};
pub use embedder::{embedder_from_config, EmbedError, Embedder, OllamaEmbedder, OpenAiEmbedder};
pub use control::Context;
pub use maintenance::MaintenanceError;
pub use scheduler::{is_valid_cron_expression, JobReport, RunStatus, Scheduler};
pub use search::{hybrid_search, SearchHit, SearchSource};
pub use watcher::{SessionWatcher, WatchEvent};
pub use worker::WorkerPool;

/// Name of the analyzer prompt file under `prompts/`.
pub const ANALYZER_PROMPT_NAME: &str = "session-analyzer";

/// Name of the generated model-additions prompt document.
pub const ADDITIONS_PROMPT_NAME: &str = "model-additions";
