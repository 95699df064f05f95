// crates/db/src/prompts.rs
//! Prompt registry: content-hashed version rows plus history copies on disk.
//!
//! Reading a prompt always goes through [`Database::register_prompt`]: the
//! file's normalized content hash either matches a known version (returned
//! as-is) or mints the next sequential version, archiving a copy under
//! `history/v{n}-{hash}-{yyyy-mm-dd}.md`.

use crate::{Database, StoreError, StoreResult};
use chrono::{DateTime, TimeZone, Utc};
use pi_brain_core::prompt::{content_hash, version_label, PromptVersion};
use sqlx::Row;
use std::path::Path;
use tracing::info;

fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> StoreResult<PromptVersion> {
    let created_at: i64 = row.try_get("created_at")?;
    Ok(PromptVersion {
        version: row.try_get("version")?,
        sequential: row.try_get("sequential")?,
        content_hash: row.try_get("content_hash")?,
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .unwrap_or_default(),
        file_path: row.try_get("file_path")?,
    })
}

/// Write a prompt file atomically (temp + rename in the same directory).
pub fn write_prompt_atomic(path: &Path, content: &str) -> StoreResult<()> {
    let parent = path.parent().ok_or_else(|| StoreError::Io {
        path: path.to_owned(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"),
    })?;
    std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
        path: parent.to_owned(),
        source: e,
    })?;
    let tmp = path.with_extension("md.tmp");
    std::fs::write(&tmp, content).map_err(|e| StoreError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::Io {
        path: path.to_owned(),
        source: e,
    })
}

impl Database {
    /// Resolve the current version of a prompt file, registering a new
    /// version when its normalized content hash is unseen.
    pub async fn register_prompt(
        &self,
        prompts_dir: &Path,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PromptVersion> {
        let file_path = prompts_dir.join(format!("{name}.md"));
        let content = std::fs::read_to_string(&file_path).map_err(|e| StoreError::Io {
            path: file_path.clone(),
            source: e,
        })?;
        let hash = content_hash(&content);

        if let Some(row) = sqlx::query("SELECT * FROM prompt_versions WHERE content_hash = ?")
            .bind(&hash)
            .fetch_optional(self.pool())
            .await?
        {
            return row_to_version(&row);
        }

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequential), 0) FROM prompt_versions")
            .fetch_one(self.pool())
            .await?;
        let sequential = row.0 + 1;
        let version = version_label(sequential, &hash);

        // Archive the exact bytes this version was minted from.
        let history_dir = prompts_dir.join("history");
        std::fs::create_dir_all(&history_dir).map_err(|e| StoreError::Io {
            path: history_dir.clone(),
            source: e,
        })?;
        let history_path = history_dir.join(format!(
            "v{}-{}-{}.md",
            sequential,
            hash,
            now.format("%Y-%m-%d")
        ));
        std::fs::copy(&file_path, &history_path).map_err(|e| StoreError::Io {
            path: history_path.clone(),
            source: e,
        })?;

        sqlx::query(
            r#"
INSERT INTO prompt_versions (version, sequential, content_hash, created_at, file_path)
VALUES (?, ?, ?, ?, ?)
"#,
        )
        .bind(&version)
        .bind(sequential)
        .bind(&hash)
        .bind(now.timestamp())
        .bind(file_path.to_string_lossy().as_ref())
        .execute(self.pool())
        .await?;

        info!(version = %version, prompt = name, "registered new prompt version");
        Ok(PromptVersion {
            version,
            sequential,
            content_hash: hash,
            created_at: now,
            file_path: file_path.to_string_lossy().into_owned(),
        })
    }

    /// Fetch a version row by its `v{n}-{hash}` label.
    pub async fn get_prompt_version(&self, version: &str) -> StoreResult<Option<PromptVersion>> {
        let row = sqlx::query("SELECT * FROM prompt_versions WHERE version = ?")
            .bind(version)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    /// All versions, oldest first.
    pub async fn list_prompt_versions(&self) -> StoreResult<Vec<PromptVersion>> {
        let rows = sqlx::query("SELECT * FROM prompt_versions ORDER BY sequential ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_version).collect()
    }
}

/// Install a default prompt file when none exists yet. Returns true when the
/// file was written.
pub fn install_default_prompt(prompts_dir: &Path, name: &str, text: &str) -> StoreResult<bool> {
    let path = prompts_dir.join(format!("{name}.md"));
    if path.exists() {
        return Ok(false);
    }
    write_prompt_atomic(&path, text)?;
    info!(path = %path.display(), "installed default prompt");
    Ok(true)
}
