// crates/daemon/src/maintenance/reanalysis.rs
//! Enqueue reanalysis jobs for nodes analyzed with an outdated prompt.

use super::MaintenanceResult;
use crate::control::Context;
use crate::ANALYZER_PROMPT_NAME;
use chrono::{DateTime, Utc};
use pi_brain_core::job::NewJob;
use tracing::info;

/// Compare every node's analyzer version to the current prompt version and
/// enqueue up to `reanalysis_limit` reanalysis jobs, skipping nodes that
/// already have one pending or running (queue-level dedup).
pub async fn run(context: &Context, now: DateTime<Utc>) -> MaintenanceResult<usize> {
    let current = context
        .db
        .register_prompt(&context.prompts_dir, ANALYZER_PROMPT_NAME, now)
        .await?;

    let limit = context.config.daemon.reanalysis_limit as i64;
    let outdated = context
        .db
        .nodes_with_outdated_analysis(&current.version, limit)
        .await?;

    let mut enqueued = 0;
    for (node_id, session_file) in outdated {
        let job = NewJob::reanalysis(session_file, node_id);
        if context
            .db
            .enqueue(&job, now, context.config.daemon.max_queue_size)
            .await?
            .is_some()
        {
            enqueued += 1;
        }
    }

    if enqueued > 0 {
        info!(enqueued, current = %current.version, "reanalysis jobs enqueued");
    }
    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::test_support::maintenance_context;
    use pi_brain_core::{JobKind, JobState, Priority};

    #[tokio::test]
    async fn test_enqueues_only_outdated_nodes_up_to_limit() {
        let (context, _dir) = maintenance_context().await;
        let now = Utc::now();

        // Current prompt version for this context's prompt file.
        let current = context
            .db
            .register_prompt(&context.prompts_dir, ANALYZER_PROMPT_NAME, now)
            .await
            .unwrap();

        // Three outdated nodes, one current.
        for i in 0..3 {
            let mut node =
                crate::maintenance::test_support::node(&format!("s{i}.jsonl"), "proj-a");
            node.metadata.analyzer_version = "v0-00000000".to_string();
            context.db.upsert_node(&node).await.unwrap();
        }
        let mut fresh = crate::maintenance::test_support::node("fresh.jsonl", "proj-a");
        fresh.metadata.analyzer_version = current.version.clone();
        context.db.upsert_node(&fresh).await.unwrap();

        let enqueued = run(&context, now).await.unwrap();
        assert_eq!(enqueued, 3);

        let jobs = context.db.list_jobs(Some(JobState::Pending), 10).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.kind == JobKind::Reanalysis));
        assert!(jobs.iter().all(|j| j.priority == Priority::REANALYSIS));

        // A second run creates no duplicates.
        let enqueued = run(&context, now).await.unwrap();
        assert_eq!(enqueued, 0);
        assert_eq!(
            context.db.list_jobs(Some(JobState::Pending), 10).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn test_respects_reanalysis_limit() {
        let (mut context_arc, _dir) = maintenance_context().await;
        {
            let context = std::sync::Arc::get_mut(&mut context_arc).unwrap();
            context.config.daemon.reanalysis_limit = 2;
        }
        let context = context_arc;
        let now = Utc::now();

        for i in 0..5 {
            let mut node =
                crate::maintenance::test_support::node(&format!("s{i}.jsonl"), "proj-a");
            node.metadata.analyzer_version = "v0-00000000".to_string();
            context.db.upsert_node(&node).await.unwrap();
        }

        let enqueued = run(&context, now).await.unwrap();
        assert_eq!(enqueued, 2);
    }
}
