// crates/daemon/src/scheduler.rs
//! Cron-driven maintenance scheduler.
//!
//! Each maintenance job runs on its configured cron expression, guarded by a
//! per-job running flag (two instances never overlap) and a dependency check
//! (a job whose dependency is absent reports `skipped`, not an error).

use crate::control::{Context, ScheduledRun};
use crate::maintenance;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Check a cron expression without scheduling it.
pub fn is_valid_cron_expression(expression: &str) -> bool {
    Schedule::from_str(expression).is_ok()
}

/// Outcome of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Skipped,
    Failed,
}

/// Report for one maintenance run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_processed: usize,
    pub status: RunStatus,
}

#[derive(Clone)]
struct ScheduledJob {
    name: &'static str,
    schedule: Schedule,
}

/// The running scheduler.
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn one timer task per maintenance job.
    pub fn spawn(
        context: Arc<Context>,
        token: CancellationToken,
    ) -> Result<Self, crate::control::DaemonError> {
        let config = &context.config.daemon;
        let specs: Vec<(&'static str, &str)> = vec![
            ("reanalysis", config.reanalysis_schedule.as_str()),
            ("connection_discovery", config.connection_discovery_schedule.as_str()),
            ("pattern_aggregation", config.pattern_aggregation_schedule.as_str()),
            ("clustering", config.clustering_schedule.as_str()),
            ("backfill_embeddings", config.backfill_embeddings_schedule.as_str()),
        ];

        let mut jobs = Vec::new();
        for (name, expression) in &specs {
            let schedule = Schedule::from_str(expression).map_err(|_| {
                crate::control::DaemonError::InvalidCron {
                    key: name.to_string(),
                    expression: expression.to_string(),
                }
            })?;
            jobs.push(ScheduledJob { name, schedule });
        }

        let running: Arc<Mutex<HashSet<&'static str>>> = Arc::new(Mutex::new(HashSet::new()));
        let handles = jobs
            .iter()
            .cloned()
            .map(|job| {
                let context = context.clone();
                let token = token.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    run_schedule_loop(job, context, token, running).await;
                })
            })
            .collect();

        Ok(Self { jobs, handles })
    }

    /// Next fire time per job, for status reporting.
    pub fn next_runs(&self) -> Vec<ScheduledRun> {
        self.jobs
            .iter()
            .map(|job| ScheduledRun {
                job_name: job.name.to_string(),
                next_run: job.schedule.upcoming(Utc).next(),
            })
            .collect()
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_schedule_loop(
    job: ScheduledJob,
    context: Arc<Context>,
    token: CancellationToken,
    running: Arc<Mutex<HashSet<&'static str>>>,
) {
    loop {
        let Some(next) = job.schedule.upcoming(Utc).next() else {
            warn!(job = job.name, "schedule yields no future runs");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        // Soft concurrency lock per job name.
        {
            let mut guard = running.lock().expect("scheduler lock");
            if !guard.insert(job.name) {
                warn!(job = job.name, "previous run still in progress, skipping");
                continue;
            }
        }
        let report = run_maintenance_job(job.name, &context).await;
        info!(
            job = report.job_name,
            status = ?report.status,
            items = report.items_processed,
            "maintenance run finished"
        );
        running.lock().expect("scheduler lock").remove(job.name);
    }
}

/// Dispatch one named maintenance job and wrap the outcome in a report.
pub async fn run_maintenance_job(name: &str, context: &Context) -> JobReport {
    let started_at = Utc::now();
    let result: Result<Option<usize>, String> = match name {
        "reanalysis" => maintenance::reanalysis::run(context, started_at)
            .await
            .map(Some)
            .map_err(|e| e.to_string()),
        "connection_discovery" => {
            if context.embedder.is_none() {
                Ok(None)
            } else {
                maintenance::connections::run(context, started_at)
                    .await
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
        }
        "pattern_aggregation" => {
            // Prompt generation and effectiveness measurement ride the
            // aggregation cadence: both need fresh frequencies and are cheap
            // by comparison. Their failures degrade the run, never fail it.
            match maintenance::aggregation::run(context, started_at).await {
                Ok(mut items) => {
                    match crate::promptgen::generate(context, started_at).await {
                        Ok(report) => items += report.insights,
                        Err(e) => warn!(error = %e, "prompt generation failed"),
                    }
                    match maintenance::effectiveness::run(context, started_at).await {
                        Ok(outcome) => items += outcome.measured,
                        Err(e) => warn!(error = %e, "effectiveness measurement failed"),
                    }
                    Ok(Some(items))
                }
                Err(e) => Err(e.to_string()),
            }
        }
        "clustering" => {
            if context.embedder.is_none() {
                Ok(None)
            } else {
                maintenance::clustering::run(context, started_at)
                    .await
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
        }
        "backfill_embeddings" => {
            if context.embedder.is_none() {
                Ok(None)
            } else {
                maintenance::backfill::run(context, started_at)
                    .await
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
        }
        "effectiveness" => maintenance::effectiveness::run(context, started_at)
            .await
            .map(|outcome| Some(outcome.measured + outcome.disabled.len()))
            .map_err(|e| e.to_string()),
        other => {
            warn!(job = other, "unknown maintenance job");
            Err(format!("unknown job {other}"))
        }
    };

    let (status, items_processed) = match result {
        Ok(Some(items)) => (RunStatus::Completed, items),
        Ok(None) => {
            info!(job = name, "dependency absent, skipping");
            (RunStatus::Skipped, 0)
        }
        Err(message) => {
            warn!(job = name, %message, "maintenance job failed");
            (RunStatus::Failed, 0)
        }
    };

    JobReport {
        job_name: name.to_string(),
        started_at,
        finished_at: Utc::now(),
        items_processed,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cron_expressions() {
        assert!(is_valid_cron_expression("0 0 3 * * *"));
        assert!(is_valid_cron_expression("0 30 4 * * Sun"));
        assert!(is_valid_cron_expression("0 */5 * * * *"));
    }

    #[test]
    fn test_invalid_cron_expressions() {
        assert!(!is_valid_cron_expression("not a cron"));
        assert!(!is_valid_cron_expression("99 99 99 * * *"));
        assert!(!is_valid_cron_expression(""));
    }

    #[test]
    fn test_default_config_schedules_are_valid() {
        let config = pi_brain_core::Config::default();
        for (key, expression) in config.schedules() {
            assert!(
                is_valid_cron_expression(expression),
                "{key} has invalid default: {expression}"
            );
        }
    }

    #[test]
    fn test_schedule_upcoming_is_in_future() {
        let schedule = Schedule::from_str("0 0 3 * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn test_run_status_serialization() {
        assert_eq!(serde_json::to_string(&RunStatus::Skipped).unwrap(), "\"skipped\"");
    }
}
