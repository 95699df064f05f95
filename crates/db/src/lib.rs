// crates/db/src/lib.rs
//! SQLite store for the pi-brain knowledge graph.
//!
//! One embedded database holds the relational tables, the FTS5 index and the
//! vector mirror; JSON node artifacts live next to it on disk. WAL mode with
//! a single writer and many readers; every multi-table mutation runs in a
//! transaction.

pub mod artifacts;
pub mod clusters;
pub mod edges;
pub mod effectiveness;
pub mod embeddings;
pub mod fts;
pub mod insights;
pub mod jobs;
mod migrations;
pub mod nodes;
pub mod prompts;
pub mod stats;
#[cfg(test)]
pub(crate) mod test_support;

pub use clusters::ClusterUpsert;
pub use effectiveness::effectiveness_id;
pub use embeddings::{cosine_similarity, decode_embedding, encode_embedding, SemanticHit};
pub use fts::{fts_query, FtsHit};
pub use insights::InsightFilter;
pub use jobs::QueueDepths;
pub use nodes::{NodeFilter, NodeSort, UpsertOutcome};
pub use prompts::{install_default_prompt, write_prompt_atomic};
pub use stats::{InsightAggregate, LessonAggregate, StatsOverview};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Embedding dimension mismatch: store has {existing}, got {incoming}")]
    DimensionMismatch { existing: i64, incoming: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database integrity check failed: {0}")]
    Corruption(String),

    #[error("Failed to determine data directory")]
    NoDataDir,
}

impl StoreError {
    /// Transient contention that the store retries internally.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::Database(db)) => {
                let message = db.message();
                message.contains("database is locked") || message.contains("database is busy")
            }
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Retry a write operation through transient SQLITE_BUSY errors with capped
/// exponential backoff. Non-busy errors propagate immediately.
pub(crate) async fn retry_busy<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_millis(20);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_busy() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, "database busy, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(500));
            }
            other => return other,
        }
    }
}

/// Main database handle wrapping a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
    nodes_dir: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// `nodes_dir` is the root for JSON node artifacts; pass `None` to skip
    /// artifact writes (degraded, used by some tests).
    pub async fn new(path: &Path, nodes_dir: Option<PathBuf>) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_owned(),
                source: e,
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(StoreError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
            nodes_dir,
        };
        db.check_integrity().await?;
        db.run_migrations().await?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses `shared_cache(true)` so all pool connections share the same
    /// in-memory database; without it each connection would get its own.
    pub async fn new_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Sqlx)?
            .shared_cache(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
            nodes_dir: None,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Point artifact writes at a directory (builder-style, mainly for tests).
    pub fn with_nodes_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.nodes_dir = Some(dir.into());
        self
    }

    /// Open the database at the default location under `~/.pi-brain/data`.
    pub async fn open_default() -> StoreResult<Self> {
        let db_path = pi_brain_core::paths::db_path().ok_or(StoreError::NoDataDir)?;
        let nodes_dir = pi_brain_core::paths::nodes_dir().ok_or(StoreError::NoDataDir)?;
        Self::new(&db_path, Some(nodes_dir)).await
    }

    /// Refuse to operate on a corrupt database; the runbook handles recovery.
    async fn check_integrity(&self) -> StoreResult<()> {
        let row: (String,) = sqlx::query_as("PRAGMA integrity_check(1)")
            .fetch_one(&self.pool)
            .await?;
        if row.0 != "ok" {
            return Err(StoreError::Corruption(row.0));
        }
        Ok(())
    }

    /// Run all inline migrations.
    ///
    /// A `_migrations` table tracks applied versions so reruns only execute
    /// new steps; each step is additionally idempotent (IF NOT EXISTS).
    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1; // 1-based
            if version > current_version {
                sqlx::query(migration).execute(&self.pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Checkpoint the WAL (called on graceful shutdown).
    pub async fn checkpoint(&self) -> StoreResult<()> {
        // The pragma reports a result row; fetch it rather than execute.
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path to the database file (empty for in-memory databases).
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Artifact root, when configured.
    pub fn nodes_dir(&self) -> Option<&Path> {
        self.nodes_dir.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_database_and_tables() {
        let db = Database::new_in_memory()
            .await
            .expect("in-memory database");

        for table in [
            "nodes",
            "node_versions",
            "edges",
            "lessons",
            "model_quirks",
            "tool_errors",
            "node_embeddings",
            "node_embeddings_vec",
            "jobs",
            "aggregated_insights",
            "clusters",
            "cluster_members",
            "prompt_versions",
            "prompt_effectiveness",
        ] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap_or_else(|e| panic!("{table} should exist: {e}"));
            assert_eq!(count.0, 0);
        }
    }

    #[tokio::test]
    async fn test_fts_table_exists() {
        let db = Database::new_in_memory().await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fts_nodes_summary")
            .fetch_one(db.pool())
            .await
            .expect("fts_nodes_summary should exist");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.expect("second run succeeds");
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_file_based_database() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("brain.db");
        let db = Database::new(&db_path, None).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_checkpoint_on_file_db() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(&tmp.path().join("brain.db"), None).await.unwrap();
        db.checkpoint().await.expect("checkpoint succeeds");
    }

    #[test]
    fn test_busy_detection_only_matches_lock_errors() {
        let err = StoreError::NotFound("x".to_string());
        assert!(!err.is_busy());
    }
}
