//! Worker pool, terminations, and the stale-requeue supervisor

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tutorflow_model::{ErrorCode, ExtractionJob, JobError, JobOutcome, JobStatus};
use tutorflow_store::{Store, TerminateRequest};

use crate::pipeline::process_one;
use crate::WorkerContext;

/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Fixed-size pool of worker tasks over a shared queue.
///
/// Workers are independent; the queue's claim semantics are the only
/// cross-worker coordination. One job runs at a time inside a worker, so
/// LLM concurrency per process is bounded by `worker_count`.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run workers plus the supervisor until `shutdown` flips true, then
    /// drain in-flight jobs up to the configured deadline. Jobs still
    /// running at the deadline are released by the next stale sweep.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let worker_count = self.ctx.config.worker.worker_count;
        let mut tasks = JoinSet::new();

        for worker_id in 0..worker_count {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = shutdown.clone();
            tasks.spawn(worker_loop(ctx, worker_id, shutdown));
        }
        {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = shutdown.clone();
            tasks.spawn(supervisor_loop(ctx, shutdown));
        }

        // Wait for the shutdown signal, then give the tasks the drain
        // window before abandoning them.
        let mut shutdown_rx = shutdown;
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        let drain = Duration::from_secs(self.ctx.config.worker.drain_deadline_s);
        info!(drain_s = drain.as_secs(), "shutdown signalled, draining workers");
        let deadline = tokio::time::sleep(drain);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                () = &mut deadline => {
                    warn!(
                        remaining = tasks.len(),
                        "drain deadline hit, abandoning in-flight workers"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize, shutdown: watch::Receiver<bool>) {
    let version = ctx.config.pipeline_version.clone();
    let batch_size = ctx.config.worker.claim_batch_size;
    debug!(worker_id, pipeline_version = %version, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let batch = match ctx.store.claim(&version, batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id, error = %e, "claim failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };
        if batch.is_empty() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }
        // Strictly sequential inside a batch: LLM concurrency per worker
        // is exactly one.
        for job in batch {
            run_job(&ctx, &job).await;
            if *shutdown.borrow() {
                // Finish the in-flight job, leave the rest of the batch
                // to the stale sweep.
                break;
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Execute one job under its wall-clock budget and terminate it.
pub async fn run_job(ctx: &Arc<WorkerContext>, job: &ExtractionJob) {
    let budget = ctx.config.worker.job_timeout();
    let outcome = match tokio::time::timeout(budget, process_one(ctx, job)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            ctx.metrics.incr("job.timeout");
            JobOutcome::Retry {
                code: ErrorCode::Timeout,
                backoff: Duration::from_secs(30),
            }
        }
    };
    let outcome = apply_retry_cap(ctx, job, outcome);
    terminate(ctx, job, outcome).await;
}

/// A retryable outcome past the attempt cap becomes a terminal failure.
fn apply_retry_cap(ctx: &WorkerContext, job: &ExtractionJob, outcome: JobOutcome) -> JobOutcome {
    match outcome {
        JobOutcome::Retry { code, .. } if job.meta.attempt >= ctx.config.worker.max_attempts => {
            warn!(
                job_id = job.id,
                attempt = job.meta.attempt,
                code = code.as_str(),
                "retry cap exhausted"
            );
            JobOutcome::Fail {
                error: Box::new(JobError::new(
                    code,
                    "retry_cap",
                    format!("gave up after {} attempts", job.meta.attempt),
                )),
            }
        }
        other => other,
    }
}

async fn terminate(ctx: &WorkerContext, job: &ExtractionJob, outcome: JobOutcome) {
    let status = outcome.terminal_status();
    let request = match outcome {
        JobOutcome::Ok { assignment_ids } => TerminateRequest {
            status,
            assignment_ids,
            llm_model: Some(ctx.extractor.model().to_string()),
            ..TerminateRequest::default()
        },
        JobOutcome::Retry { code, backoff } => TerminateRequest {
            status: JobStatus::Pending,
            error: Some(JobError::new(code, "requeue", "transient condition")),
            requeue_reason: Some(code.as_str().to_string()),
            not_before: Some(
                Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            ),
            ..TerminateRequest::default()
        },
        JobOutcome::Skip { code } => TerminateRequest {
            status,
            error: Some(JobError::new(code, "prefilter", code.as_str())),
            ..TerminateRequest::default()
        },
        JobOutcome::Fail { error } => TerminateRequest {
            status,
            error: Some(*error),
            ..TerminateRequest::default()
        },
    };
    let final_status = request.status;
    if let Err(e) = ctx.store.terminate(job.id, request).await {
        error!(job_id = job.id, error = %e, "terminate failed, stale sweep will recover");
    } else {
        ctx.metrics.incr(&format!("job.{final_status}"));
    }
}

/// Periodic stale-requeue sweep.
async fn supervisor_loop(ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.worker.stale_requeue_s.max(1));
    let stale_after = ctx.config.worker.stale_after();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::time::sleep(period).await;
        match ctx.store.requeue_stale(stale_after).await {
            Ok(0) => {}
            Ok(n) => info!(requeued = n, "stale sweep returned jobs to pending"),
            Err(e) => error!(error = %e, "stale sweep failed"),
        }
    }
}
