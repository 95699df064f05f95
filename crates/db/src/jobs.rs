// crates/db/src/jobs.rs
//! Durable analysis queue on the `jobs` table.
//!
//! FIFO within priority (lower runs sooner). Leasing is a single atomic
//! UPDATE guarded by `state = 'pending' AND run_at <= now`, so at most one
//! worker ever holds a job. Every time-sensitive operation takes `now` as a
//! parameter; the daemon passes the wall clock, tests pass fixtures.

use crate::{retry_busy, Database, StoreResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use pi_brain_core::job::{Job, JobKind, JobState, NewJob};
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

/// Backoff cap: a retry never waits longer than this many minutes.
const MAX_BACKOFF_MINUTES: i64 = 60;

/// Pending/running counts per kind, for `/daemon/queue`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub completed: i64,
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Job> {
    let kind_str: String = row.try_get("kind")?;
    let state_str: String = row.try_get("state")?;
    let run_at: i64 = row.try_get("run_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let leased_until: Option<i64> = row.try_get("leased_until")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: JobKind::parse(&kind_str).unwrap_or(JobKind::Initial),
        session_file: row.try_get("session_file")?,
        node_id: row.try_get("node_id")?,
        priority: row.try_get("priority")?,
        run_at: ts(run_at),
        attempts: row.try_get("attempts")?,
        worker_id: row.try_get("worker_id")?,
        leased_until: leased_until.map(ts),
        state: JobState::parse(&state_str).unwrap_or(JobState::Pending),
        last_error: row.try_get("last_error")?,
        created_at: ts(created_at),
    })
}

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

impl Database {
    /// Enqueue a job unless an equivalent one is already pending or running.
    ///
    /// Returns the job id, or `None` when deduplicated or deferred by
    /// `max_queue_size`.
    pub async fn enqueue(
        &self,
        new_job: &NewJob,
        now: DateTime<Utc>,
        max_queue_size: Option<usize>,
    ) -> StoreResult<Option<i64>> {
        if self
            .has_existing_job(
                new_job.kind,
                new_job.session_file.as_deref(),
                new_job.node_id.as_deref(),
            )
            .await?
        {
            debug!(kind = new_job.kind.as_str(), "enqueue deduplicated");
            return Ok(None);
        }

        if let Some(max) = max_queue_size {
            let depths = self.queue_depths().await?;
            if depths.pending as usize >= max {
                info!(
                    pending = depths.pending,
                    max, "queue full, deferring enqueue"
                );
                return Ok(None);
            }
        }

        let run_at = new_job.run_at.unwrap_or(now);
        let result = sqlx::query(
            r#"
INSERT INTO jobs (kind, session_file, node_id, priority, run_at, state, created_at)
VALUES (?, ?, ?, ?, ?, 'pending', ?)
"#,
        )
        .bind(new_job.kind.as_str())
        .bind(&new_job.session_file)
        .bind(&new_job.node_id)
        .bind(new_job.priority)
        .bind(run_at.timestamp())
        .bind(now.timestamp())
        .execute(self.pool())
        .await?;
        Ok(Some(result.last_insert_rowid()))
    }

    /// Enqueue many jobs; returns the number actually inserted.
    pub async fn enqueue_many(
        &self,
        jobs: &[NewJob],
        now: DateTime<Utc>,
        max_queue_size: Option<usize>,
    ) -> StoreResult<usize> {
        let mut inserted = 0;
        for job in jobs {
            if self.enqueue(job, now, max_queue_size).await?.is_some() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Whether a pending/running job exists for the same kind and target.
    pub async fn has_existing_job(
        &self,
        kind: JobKind,
        session_file: Option<&str>,
        node_id: Option<&str>,
    ) -> StoreResult<bool> {
        let row: (i64,) = sqlx::query_as(
            r#"
SELECT COUNT(*) FROM jobs
WHERE kind = ?
  AND state IN ('pending', 'running')
  AND (? IS NULL OR session_file = ?)
  AND (? IS NULL OR node_id = ?)
"#,
        )
        .bind(kind.as_str())
        .bind(session_file)
        .bind(session_file)
        .bind(node_id)
        .bind(node_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0 > 0)
    }

    /// Atomically lease the runnable job with the lowest priority value,
    /// oldest first. Returns `None` when nothing is runnable.
    pub async fn lease_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> StoreResult<Option<Job>> {
        let worker_id = worker_id.to_string();
        retry_busy(|| {
            let worker_id = worker_id.clone();
            async move {
                let row = sqlx::query(
                    r#"
UPDATE jobs
SET state = 'running', worker_id = ?, leased_until = ?
WHERE id = (
    SELECT id FROM jobs
    WHERE state = 'pending' AND run_at <= ?
    ORDER BY priority ASC, run_at ASC, id ASC
    LIMIT 1
) AND state = 'pending'
RETURNING *
"#,
                )
                .bind(&worker_id)
                .bind((now + lease_duration).timestamp())
                .bind(now.timestamp())
                .fetch_optional(self.pool())
                .await?;
                row.as_ref().map(row_to_job).transpose()
            }
        })
        .await
    }

    /// Mark a job completed.
    pub async fn complete_job(&self, job_id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', worker_id = NULL, leased_until = NULL WHERE id = ?",
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a failure. Below `max_retries` the job re-queues with
    /// exponential backoff (`2^attempts` minutes, capped); at `max_retries`
    /// it terminates in `failed`.
    pub async fn fail_job(
        &self,
        job_id: i64,
        error: &str,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> StoreResult<JobState> {
        let row = sqlx::query("SELECT attempts FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(JobState::Failed);
        };
        let attempts: i64 = row.try_get("attempts")?;
        let new_attempts = attempts + 1;

        let state = if new_attempts < max_retries as i64 {
            let backoff_minutes = 2i64
                .checked_pow(new_attempts.min(30) as u32)
                .unwrap_or(MAX_BACKOFF_MINUTES)
                .min(MAX_BACKOFF_MINUTES);
            let run_at = now + Duration::minutes(backoff_minutes);
            sqlx::query(
                r#"
UPDATE jobs
SET state = 'pending', attempts = ?, run_at = ?, last_error = ?,
    worker_id = NULL, leased_until = NULL
WHERE id = ?
"#,
            )
            .bind(new_attempts)
            .bind(run_at.timestamp())
            .bind(error)
            .bind(job_id)
            .execute(self.pool())
            .await?;
            JobState::Pending
        } else {
            sqlx::query(
                r#"
UPDATE jobs
SET state = 'failed', attempts = ?, last_error = ?,
    worker_id = NULL, leased_until = NULL
WHERE id = ?
"#,
            )
            .bind(new_attempts)
            .bind(error)
            .bind(job_id)
            .execute(self.pool())
            .await?;
            JobState::Failed
        };
        debug!(job_id, ?state, "job failure recorded");
        Ok(state)
    }

    /// Fail a job permanently, ignoring the retry budget (invalid segment
    /// references and other non-retryable errors).
    pub async fn fail_job_permanently(&self, job_id: i64, error: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE jobs
SET state = 'failed', last_error = ?, worker_id = NULL, leased_until = NULL
WHERE id = ?
"#,
        )
        .bind(error)
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Release a held job back to pending without counting a failure
    /// (graceful shutdown).
    pub async fn release_job(&self, job_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE jobs
SET state = 'pending', worker_id = NULL, leased_until = NULL
WHERE id = ? AND state = 'running'
"#,
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Reset expired leases back to pending, preserving attempts. Idempotent;
    /// must run at daemon startup before any worker leases.
    pub async fn release_stale(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET state = 'pending', worker_id = NULL, leased_until = NULL
WHERE state = 'running' AND leased_until < ?
"#,
        )
        .bind(now.timestamp())
        .execute(self.pool())
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released stale job leases");
        }
        Ok(released)
    }

    /// Delete completed jobs older than the cutoff. Returns the count removed.
    pub async fn clear_old_completed(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND created_at < ?")
            .bind(older_than.timestamp())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// List jobs, optionally filtered by state, newest first.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> StoreResult<Vec<Job>> {
        let rows = match state {
            Some(s) => {
                sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY id DESC LIMIT ?")
                    .bind(s.as_str())
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    /// Fetch one job.
    pub async fn get_job(&self, job_id: i64) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Counts by state.
    pub async fn queue_depths(&self) -> StoreResult<QueueDepths> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(self.pool())
            .await?;
        let mut depths = QueueDepths::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match state.as_str() {
                "pending" => depths.pending = n,
                "running" => depths.running = n,
                "failed" => depths.failed = n,
                "completed" => depths.completed = n,
                _ => {}
            }
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_brain_core::job::Priority;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn db() -> Database {
        Database::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_lease_fifo_within_priority() {
        let db = db().await;
        let now = t0();

        db.enqueue(&NewJob::connection_discovery(), now, None)
            .await
            .unwrap();
        db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        db.enqueue(&NewJob::initial("b.jsonl"), now, None).await.unwrap();

        // INITIAL (100) beats CONNECTION (300); a.jsonl enqueued before b.
        let first = db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, JobKind::Initial);
        assert_eq!(first.session_file.as_deref(), Some("a.jsonl"));
        assert_eq!(first.state, JobState::Running);
        assert_eq!(first.worker_id.as_deref(), Some("w1"));

        let second = db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.session_file.as_deref(), Some("b.jsonl"));

        let third = db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.kind, JobKind::ConnectionDiscovery);
    }

    #[tokio::test]
    async fn test_lease_respects_run_at() {
        let db = db().await;
        let now = t0();
        let mut job = NewJob::initial("a.jsonl");
        job.run_at = Some(now + Duration::minutes(5));
        db.enqueue(&job, now, None).await.unwrap();

        assert!(db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .is_none());
        assert!(db
            .lease_job("w1", now + Duration::minutes(6), Duration::minutes(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_at_most_one_holder_per_job() {
        let db = db().await;
        let now = t0();
        db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();

        let first = db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        assert!(first.is_some());
        let second = db.lease_job("w2", now, Duration::minutes(10)).await.unwrap();
        assert!(second.is_none(), "job must not be leased twice");
    }

    #[tokio::test]
    async fn test_enqueue_dedups_pending_and_running() {
        let db = db().await;
        let now = t0();

        let id = db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        assert!(id.is_some());
        let dup = db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        assert!(dup.is_none());

        // Still deduped while running.
        db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        let dup = db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        assert!(dup.is_none());

        // A different file is a different job.
        let other = db.enqueue(&NewJob::initial("b.jsonl"), now, None).await.unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_defers_when_queue_full() {
        let db = db().await;
        let now = t0();
        db.enqueue(&NewJob::initial("a.jsonl"), now, Some(1)).await.unwrap();
        let deferred = db
            .enqueue(&NewJob::initial("b.jsonl"), now, Some(1))
            .await
            .unwrap();
        assert!(deferred.is_none());
    }

    #[tokio::test]
    async fn test_fail_requeues_with_backoff_then_terminates() {
        let db = db().await;
        let now = t0();
        let id = db
            .enqueue(&NewJob::initial("a.jsonl"), now, None)
            .await
            .unwrap()
            .unwrap();

        // Attempt 1 of 3: requeued at +2 minutes.
        db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        let state = db.fail_job(id, "boom", now, 3).await.unwrap();
        assert_eq!(state, JobState::Pending);
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.run_at, now + Duration::minutes(2));

        // Attempt 2 of 3: requeued at +4 minutes.
        let later = now + Duration::minutes(3);
        db.lease_job("w1", later, Duration::minutes(10)).await.unwrap();
        let state = db.fail_job(id, "boom again", later, 3).await.unwrap();
        assert_eq!(state, JobState::Pending);
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.run_at, later + Duration::minutes(4));

        // Attempt 3 == max_retries: terminates failed, not pending.
        let latest = later + Duration::minutes(5);
        db.lease_job("w1", latest, Duration::minutes(10)).await.unwrap();
        let state = db.fail_job(id, "final", latest, 3).await.unwrap();
        assert_eq!(state, JobState::Failed);
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("final"));
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let db = db().await;
        let now = t0();
        let id = db
            .enqueue(&NewJob::initial("a.jsonl"), now, None)
            .await
            .unwrap()
            .unwrap();
        // Simulate a job that has already failed many times.
        sqlx::query("UPDATE jobs SET attempts = 9 WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
        db.fail_job(id, "x", now, 100).await.unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.run_at, now + Duration::minutes(60), "2^10 min capped at 60");
    }

    #[tokio::test]
    async fn test_release_stale_idempotent() {
        let db = db().await;
        let now = t0();
        db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        let job = db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();

        // Lease not yet expired: nothing released.
        let later = now + Duration::minutes(5);
        assert_eq!(db.release_stale(later).await.unwrap(), 0);

        // Lease expired: released exactly once, attempts preserved.
        let expired = now + Duration::minutes(11);
        assert_eq!(db.release_stale(expired).await.unwrap(), 1);
        let released = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(released.state, JobState::Pending);
        assert_eq!(released.attempts, job.attempts);
        assert!(released.worker_id.is_none());

        // Second call with the same now: same state, zero released.
        assert_eq!(db.release_stale(expired).await.unwrap(), 0);
        let again = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(again.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_crash_recovery_releases_then_releases() {
        // A worker died holding the job; after release_stale the job can be
        // leased again with attempts intact.
        let db = db().await;
        let now = t0();
        db.enqueue(&NewJob::initial("a.jsonl"), now, None).await.unwrap();
        db.lease_job("dead-worker", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();

        let restart = now + Duration::minutes(30);
        db.release_stale(restart).await.unwrap();

        let release = db
            .lease_job("fresh-worker", restart, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.worker_id.as_deref(), Some("fresh-worker"));
    }

    #[tokio::test]
    async fn test_release_job_does_not_count_failure() {
        let db = db().await;
        let now = t0();
        let id = db
            .enqueue(&NewJob::initial("a.jsonl"), now, None)
            .await
            .unwrap()
            .unwrap();
        db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        db.release_job(id).await.unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_complete_and_clear_old() {
        let db = db().await;
        let now = t0();
        let id = db
            .enqueue(&NewJob::initial("a.jsonl"), now, None)
            .await
            .unwrap()
            .unwrap();
        db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        db.complete_job(id).await.unwrap();

        let depths = db.queue_depths().await.unwrap();
        assert_eq!(depths.completed, 1);

        let cleared = db.clear_old_completed(now + Duration::days(1)).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(db.get_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_triggered_priority_wins() {
        let db = db().await;
        let now = t0();
        db.enqueue(&NewJob::initial("later.jsonl"), now, None).await.unwrap();
        db.enqueue(
            &NewJob::initial("urgent.jsonl").with_priority(Priority::USER_TRIGGERED),
            now,
            None,
        )
        .await
        .unwrap();

        let first = db
            .lease_job("w1", now, Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.session_file.as_deref(), Some("urgent.jsonl"));
    }

    #[tokio::test]
    async fn test_list_jobs_by_state() {
        let db = db().await;
        let now = t0();
        let id = db
            .enqueue(&NewJob::initial("a.jsonl"), now, None)
            .await
            .unwrap()
            .unwrap();
        db.enqueue(&NewJob::initial("b.jsonl"), now, None).await.unwrap();
        db.lease_job("w1", now, Duration::minutes(10)).await.unwrap();
        db.fail_job_permanently(id, "bad segment").await.unwrap();

        let failed = db.list_jobs(Some(JobState::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("bad segment"));

        let all = db.list_jobs(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
