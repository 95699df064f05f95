// crates/daemon/src/worker.rs
//! Analysis worker pool.
//!
//! Each worker loops lease → process → complete/fail. Within one worker the
//! order is strict: lease, subprocess, upsert, broadcast, complete. Across
//! workers only the per-job at-most-one-holder guarantee applies. On
//! cancellation a held job is released (not failed) so a restart re-leases
//! it.

use crate::analyzer::{AnalyzeRequest, AnalyzerError, Capability};
use crate::control::{BrainEvent, Context};
use crate::maintenance;
use chrono::{Duration as ChronoDuration, Utc};
use pi_brain_core::boundary::{detect_boundaries, split_segments, Boundary, Segment};
use pi_brain_core::job::{Job, JobKind};
use pi_brain_core::node::{node_id, validate_analyzer_response, Node, NodeMetadata};
use pi_brain_core::session::{parse_session_file, ParsedSession};
use pi_brain_core::signals::derive_signals;
use pi_brain_core::EdgeKind;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a lease lasts before `release_stale` may reclaim it.
const LEASE_DURATION_MINUTES: i64 = 30;

/// Poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Re-check interval while the analyzer is unavailable.
const ANALYZER_RETRY: Duration = Duration::from_secs(30);

/// How a processing attempt ended.
#[derive(Debug)]
enum ProcessError {
    /// Retryable per the queue's backoff policy.
    Transient(String),
    /// Not worth retrying (invalid segment reference and friends).
    Permanent(String),
    /// The job was released because shutdown was requested.
    Released,
}

/// The running pool of analysis workers.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `parallel_workers` workers sharing one subprocess-concurrency
    /// semaphore (`max_concurrent_analysis`).
    pub fn spawn(context: Arc<Context>, token: CancellationToken) -> Self {
        let permits = context.config.daemon.max_concurrent_analysis;
        let semaphore = Arc::new(Semaphore::new(permits));
        let handles = (0..context.config.daemon.parallel_workers)
            .map(|index| {
                let context = context.clone();
                let token = token.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    worker_loop(index, context, token, semaphore).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to observe cancellation and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    index: usize,
    context: Arc<Context>,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
) {
    let worker_id = format!("worker-{index}");
    info!(worker = %worker_id, "worker started");

    // Environment validation is non-fatal: a missing analyzer idles the
    // worker instead of crashing the daemon.
    while context.analyzer.health_check().await.is_err() {
        warn!(worker = %worker_id, "analyzer unavailable, idling");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(ANALYZER_RETRY) => {}
        }
    }

    loop {
        if token.is_cancelled() {
            break;
        }
        let now = Utc::now();
        let job = match context
            .db
            .lease_job(&worker_id, now, ChronoDuration::minutes(LEASE_DURATION_MINUTES))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "lease failed");
                None
            }
        };

        let Some(job) = job else {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        };

        debug!(worker = %worker_id, job_id = job.id, kind = job.kind.as_str(), "processing job");
        let result = match job.kind {
            JobKind::Initial | JobKind::Reanalysis => {
                process_analysis(&context, &job, &token, &semaphore).await
            }
            JobKind::ConnectionDiscovery => {
                match maintenance::connections::run(&context, Utc::now()).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(ProcessError::Transient(e.to_string())),
                }
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = context.db.complete_job(job.id).await {
                    warn!(job_id = job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(ProcessError::Released) => {
                if let Err(e) = context.db.release_job(job.id).await {
                    warn!(job_id = job.id, error = %e, "failed to release job");
                }
                break;
            }
            Err(ProcessError::Permanent(message)) => {
                warn!(job_id = job.id, %message, "job failed permanently");
                if let Err(e) = context.db.fail_job_permanently(job.id, &message).await {
                    warn!(job_id = job.id, error = %e, "failed to record permanent failure");
                }
            }
            Err(ProcessError::Transient(message)) => {
                warn!(job_id = job.id, %message, "job failed, scheduling retry");
                let max_retries = context.config.daemon.max_retries;
                if let Err(e) = context
                    .db
                    .fail_job(job.id, &message, Utc::now(), max_retries)
                    .await
                {
                    warn!(job_id = job.id, error = %e, "failed to record failure");
                }
            }
        }
    }
    info!(worker = %worker_id, "worker stopped");
}

/// Process one `initial`/`reanalysis` job end to end.
async fn process_analysis(
    context: &Context,
    job: &Job,
    token: &CancellationToken,
    semaphore: &Semaphore,
) -> Result<(), ProcessError> {
    let session_file = job
        .session_file
        .as_deref()
        .ok_or_else(|| ProcessError::Permanent("analysis job without session file".to_string()))?;

    // 1. Parse the session and locate the target segment.
    let session = parse_session_file(Path::new(session_file))
        .await
        .map_err(|e| ProcessError::Transient(format!("parse failed: {e}")))?;
    let boundaries = detect_boundaries(&session);
    let segments = split_segments(&session, &boundaries);
    if segments.is_empty() {
        return Err(ProcessError::Permanent("session has no segments".to_string()));
    }

    let segment = match job.kind {
        JobKind::Reanalysis => {
            let node_id = job.node_id.as_deref().ok_or_else(|| {
                ProcessError::Permanent("reanalysis job without node id".to_string())
            })?;
            let node = context
                .db
                .get_node(node_id)
                .await
                .map_err(|e| ProcessError::Transient(e.to_string()))?
                .ok_or_else(|| {
                    ProcessError::Permanent(format!("reanalysis target {node_id} not found"))
                })?;
            segments
                .iter()
                .find(|s| s.end_entry_id == node.source.segment.end_entry_id)
                .cloned()
                .ok_or_else(|| {
                    // The file changed out from under the stored segment.
                    ProcessError::Permanent("stored segment no longer exists".to_string())
                })?
        }
        _ => segments.last().cloned().expect("non-empty segments"),
    };

    // 2. Resolve the current prompt version.
    let now = Utc::now();
    let prompt_version = context
        .db
        .register_prompt(&context.prompts_dir, crate::ANALYZER_PROMPT_NAME, now)
        .await
        .map_err(|e| ProcessError::Transient(format!("prompt registry: {e}")))?;

    // 3. Run the analyzer subprocess, bounded by the configured timeout and
    //    the global subprocess-concurrency cap.
    let permit = tokio::select! {
        _ = token.cancelled() => return Err(ProcessError::Released),
        permit = semaphore.acquire() => permit.map_err(|_| ProcessError::Released)?,
    };
    let request = AnalyzeRequest {
        provider: context.config.daemon.provider.clone(),
        model: context.config.daemon.model.clone(),
        system_prompt_path: prompt_version.file_path.clone().into(),
        capabilities: vec![
            Capability::required("long-file-reader"),
            Capability::optional("code-structure-map"),
        ],
        user_prompt: build_user_prompt(&session, &segment),
        timeout: Duration::from_secs(context.config.daemon.analysis_timeout_minutes * 60),
    };
    let response = tokio::select! {
        _ = token.cancelled() => {
            drop(permit);
            return Err(ProcessError::Released);
        }
        response = context.analyzer.analyze(&request) => response,
    };
    drop(permit);

    let text = response.map_err(|e| match e {
        AnalyzerError::Timeout(d) => ProcessError::Transient(format!("timeout after {d:?}")),
        other => ProcessError::Transient(other.to_string()),
    })?;

    // 4. Validate and persist.
    let payload =
        validate_analyzer_response(&text).map_err(|e| ProcessError::Transient(e.to_string()))?;

    let id = node_id(session_file, &segment.start_entry_id, &segment.end_entry_id);
    let prior = context
        .db
        .latest_node_for_project(&payload.classification.project, &id)
        .await
        .map_err(|e| ProcessError::Transient(e.to_string()))?;
    let signals = derive_signals(&session, &segment, &payload, prior.as_ref());

    let segment_end_ts = session
        .entry(&segment.end_entry_id)
        .map(|e| e.timestamp)
        .unwrap_or(now);
    let usage = payload.metadata.clone().unwrap_or_default();
    let node = Node {
        id: id.clone(),
        version: 1,
        source: pi_brain_core::node::NodeSource {
            session_file: session_file.to_string(),
            segment: segment.clone(),
            session_id: session.header.id.clone(),
            computer: context.computer.clone(),
        },
        classification: payload.classification,
        content: payload.content,
        lessons: payload.lessons,
        observations: payload.observations,
        metadata: NodeMetadata {
            tokens_used: usage.tokens_used,
            cost: usage.cost,
            duration_minutes: usage.duration_minutes,
            timestamp: segment_end_ts,
            analyzed_at: now,
            analyzer_version: prompt_version.version.clone(),
        },
        semantic: payload.semantic,
        signals,
        daemon_meta: pi_brain_core::node::DaemonMeta::default(),
    };

    let outcome = context
        .db
        .upsert_node(&node)
        .await
        .map_err(|e| ProcessError::Transient(e.to_string()))?;
    let node = outcome.node;

    // 5. Structural edges from the segment's start boundaries, predecessor
    //    within the project, fork to the parent session's last node.
    create_structural_edges(context, &session, &segment, &node, prior.as_ref()).await;

    // 6. Embedding (best effort: a missing embedder or dimension mismatch
    //    never fails the job).
    if let Some(embedder) = &context.embedder {
        let doc = node.search_document();
        match embedder.embed(&[doc.clone()]).await {
            Ok(vectors) => {
                if let Some(vector) = vectors.first() {
                    let text_hash = doc_hash(&doc);
                    if let Err(e) = context
                        .db
                        .upsert_embedding(&node.id, embedder.model(), vector, &text_hash)
                        .await
                    {
                        warn!(node_id = %node.id, error = %e, "embedding write skipped");
                    }
                }
            }
            Err(e) => warn!(node_id = %node.id, error = %e, "embedding failed"),
        }
    }

    // 7. Fold this node's observations into the aggregated insights.
    if let Err(e) = maintenance::aggregation::apply_node_observations(&context.db, &node).await {
        warn!(node_id = %node.id, error = %e, "insight update failed");
    }

    // 8. Broadcast.
    if outcome.created {
        context.broadcast(BrainEvent::node_created(&node));
    }
    context.broadcast(BrainEvent::analysis_completed(&node.id, session_file));

    info!(node_id = %node.id, version = node.version, "analysis stored");
    Ok(())
}

/// Hash of the embedded document, stored to detect stale embeddings.
pub(crate) fn doc_hash(doc: &str) -> String {
    let digest = Sha256::digest(doc.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn build_user_prompt(session: &ParsedSession, segment: &Segment) -> String {
    let mut prompt = format!(
        "Session {} in {}\n\n",
        session.header.id, session.header.cwd
    );
    for boundary in &segment.start_boundaries {
        prompt.push_str(&format!("Segment starts at a {} boundary.\n", boundary.kind_str()));
    }
    prompt.push('\n');
    prompt.push_str(&session.render_entries(&segment.start_entry_id, &segment.end_entry_id));
    prompt
}

/// Map each start boundary to a structural edge from the session's previous
/// node, link the predecessor within the project, and wire fork edges from
/// the parent session's last node.
async fn create_structural_edges(
    context: &Context,
    session: &ParsedSession,
    segment: &Segment,
    node: &Node,
    prior_in_project: Option<&Node>,
) {
    let previous_in_session = session_predecessor(context, session, node).await;

    for boundary in &segment.start_boundaries {
        let (kind, metadata) = match boundary {
            Boundary::Branch { from_id, summary } => (
                EdgeKind::Branch,
                serde_json::json!({ "fromId": from_id, "summary": summary }),
            ),
            Boundary::TreeJump { from_id, to_id } => (
                EdgeKind::TreeJump,
                serde_json::json!({ "fromId": from_id, "toId": to_id }),
            ),
            Boundary::Compaction {
                summary,
                tokens_before,
            } => (
                EdgeKind::Compaction,
                serde_json::json!({ "summary": summary, "tokensBefore": tokens_before }),
            ),
            Boundary::Resume { gap_minutes } => (
                EdgeKind::Resume,
                serde_json::json!({ "gapMinutes": gap_minutes }),
            ),
            Boundary::Fork { parent_session } => {
                // Fork edges come from the parent session's last node.
                match context.db.last_node_of_session(parent_session).await {
                    Ok(Some(parent_node)) => {
                        if let Err(e) = context
                            .db
                            .create_edge(
                                &parent_node.id,
                                &node.id,
                                EdgeKind::Fork,
                                serde_json::json!({ "parentSession": parent_session }),
                            )
                            .await
                        {
                            warn!(error = %e, "fork edge failed");
                        }
                    }
                    Ok(None) => {
                        debug!(parent = %parent_session, "fork parent has no nodes yet");
                    }
                    Err(e) => warn!(error = %e, "fork parent lookup failed"),
                }
                continue;
            }
        };

        if let Some(previous) = &previous_in_session {
            if let Err(e) = context
                .db
                .create_edge(&previous.id, &node.id, kind, metadata)
                .await
            {
                warn!(error = %e, kind = kind.as_str(), "structural edge failed");
            }
        }
    }

    if let Some(prior) = prior_in_project {
        if prior.id != node.id {
            if let Err(e) = context
                .db
                .create_edge(&prior.id, &node.id, EdgeKind::Predecessor, serde_json::json!({}))
                .await
            {
                warn!(error = %e, "predecessor edge failed");
            }
        }
    }
}

/// The latest stored node of this session other than the current one.
async fn session_predecessor(
    context: &Context,
    session: &ParsedSession,
    node: &Node,
) -> Option<Node> {
    match context.db.nodes_for_session(&session.header.id).await {
        Ok(nodes) => nodes.into_iter().filter(|n| n.id != node.id).next_back(),
        Err(e) => {
            warn!(error = %e, "session predecessor lookup failed");
            None
        }
    }
}
