// crates/core/src/config.rs
//! YAML configuration loaded from `~/.pi-brain/config.yaml`.
//!
//! Unknown keys are ignored for forward compatibility. Path fields expand a
//! leading `~`. Validation errors fail fast with explicit messages; cron
//! schedule strings are validated by the scheduler at daemon startup.

use crate::error::ConfigError;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub spokes: Vec<SpokeConfig>,
}

/// Embedding provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Ollama,
    Openai,
    Openrouter,
}

/// `daemon:` section — ingestion, analysis and maintenance knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout_minutes: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_analysis: usize,
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub embedding_provider: Option<EmbeddingProvider>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Write-only at the API surface: the key round-trips through config
    /// persistence, but HTTP responses redact it (see the config routes).
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default)]
    pub embedding_base_url: Option<String>,
    #[serde(default)]
    pub embedding_dimensions: Option<usize>,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_search_threshold: f32,
    #[serde(default = "default_reanalysis_schedule")]
    pub reanalysis_schedule: String,
    #[serde(default = "default_connection_schedule")]
    pub connection_discovery_schedule: String,
    #[serde(default = "default_aggregation_schedule")]
    pub pattern_aggregation_schedule: String,
    #[serde(default = "default_clustering_schedule")]
    pub clustering_schedule: String,
    #[serde(default = "default_backfill_schedule")]
    pub backfill_embeddings_schedule: String,
    #[serde(default = "default_reanalysis_limit")]
    pub reanalysis_limit: usize,
    #[serde(default = "default_connection_limit")]
    pub connection_discovery_limit: usize,
    #[serde(default = "default_lookback_days")]
    pub connection_discovery_lookback_days: i64,
    #[serde(default = "default_cooldown_hours")]
    pub connection_discovery_cooldown_hours: i64,
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    #[serde(default = "default_clustering_algorithm")]
    pub clustering_algorithm: String,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
}

fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_idle_timeout() -> u64 {
    10
}
fn default_parallel_workers() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    60
}
fn default_analysis_timeout() -> u64 {
    10
}
fn default_max_concurrent() -> usize {
    2
}
fn default_semantic_threshold() -> f32 {
    0.5
}
fn default_reanalysis_schedule() -> String {
    "0 0 3 * * *".to_string()
}
fn default_connection_schedule() -> String {
    "0 30 3 * * *".to_string()
}
fn default_aggregation_schedule() -> String {
    "0 0 4 * * *".to_string()
}
fn default_clustering_schedule() -> String {
    "0 30 4 * * Sun".to_string()
}
fn default_backfill_schedule() -> String {
    "0 0 5 * * *".to_string()
}
fn default_reanalysis_limit() -> usize {
    50
}
fn default_connection_limit() -> usize {
    200
}
fn default_lookback_days() -> i64 {
    30
}
fn default_cooldown_hours() -> i64 {
    72
}
fn default_backfill_limit() -> usize {
    100
}
fn default_clustering_algorithm() -> String {
    "density".to_string()
}
fn default_min_cluster_size() -> usize {
    3
}

impl Default for DaemonConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty daemon config deserializes")
    }
}

/// `query:` section — provider/model used for interactive queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
        }
    }
}

/// `api:` section — HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8765
}
fn default_host() -> String {
    "localhost".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_origins: Vec::new(),
        }
    }
}

/// `hub:` section — where sessions and data live on this machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default)]
    pub sessions_dir: Option<String>,
    #[serde(default)]
    pub database_dir: Option<String>,
    #[serde(default)]
    pub web_ui_port: Option<u16>,
}

/// One remote machine syncing sessions into the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeConfig {
    pub name: String,
    pub sync_method: SyncMethod,
    pub path: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub rsync_options: Option<RsyncOptions>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Syncthing,
    Rsync,
    Api,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsyncOptions {
    #[serde(default)]
    pub bw_limit: Option<u32>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Config {
    /// Load config from the default location, or defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = paths::config_path().ok_or(ConfigError::HomeDirNotFound)?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load and validate config from an explicit path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_owned(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_owned(),
                    source: e,
                }
            }
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| ConfigError::InvalidYaml {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants. Cron expressions are validated by the
    /// scheduler, which owns the cron parser.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.parallel_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "daemon.parallelWorkers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.daemon.max_concurrent_analysis == 0 {
            return Err(ConfigError::InvalidValue {
                key: "daemon.maxConcurrentAnalysis".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.daemon.semantic_search_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "daemon.semanticSearchThreshold".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        if let Some(dims) = self.daemon.embedding_dimensions {
            if dims == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "daemon.embeddingDimensions".to_string(),
                    message: "must be positive".to_string(),
                });
            }
        }
        for spoke in &self.spokes {
            if spoke.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "spokes[].name".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolved sessions directory with `~` expansion.
    pub fn sessions_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.hub.sessions_dir {
            Some(dir) => Ok(paths::expand_tilde(dir)),
            None => paths::default_sessions_dir().ok_or(ConfigError::HomeDirNotFound),
        }
    }

    /// Resolved database directory with `~` expansion.
    pub fn database_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.hub.database_dir {
            Some(dir) => Ok(paths::expand_tilde(dir)),
            None => paths::brain_home()
                .map(|p| p.join("data"))
                .ok_or(ConfigError::HomeDirNotFound),
        }
    }

    /// All schedule expressions with their config keys, for startup validation.
    pub fn schedules(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("daemon.reanalysisSchedule", self.daemon.reanalysis_schedule.as_str()),
            (
                "daemon.connectionDiscoverySchedule",
                self.daemon.connection_discovery_schedule.as_str(),
            ),
            (
                "daemon.patternAggregationSchedule",
                self.daemon.pattern_aggregation_schedule.as_str(),
            ),
            ("daemon.clusteringSchedule", self.daemon.clustering_schedule.as_str()),
            (
                "daemon.backfillEmbeddingsSchedule",
                self.daemon.backfill_embeddings_schedule.as_str(),
            ),
        ]
    }
}
