use futures::FutureExt;
use parking_lot::Mutex;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    CourierError, JobKind, Storage,
    handler::{Context, Handler, JobError},
    job_envelope::JobEnvelope,
    reporter::{FailureReport, FailureReportKind, Reporter},
    retry::FailureKind,
    stats::{AttemptOutcome, RunStats},
    storage::FailOutcome,
};

/// Tuning for the workers of one queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Number of worker loops this process runs for the queue.
    pub concurrency: usize,
    /// How long a claimed job stays leased without a heartbeat.
    pub lease: Duration,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep between claims when the store cannot be reached.
    pub store_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            store_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store_backoff(mut self, store_backoff: Duration) -> Self {
        self.store_backoff = store_backoff;
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

pub(crate) struct QueueWorker<J, C> {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn Handler<J, C>>,
    pub(crate) options: WorkerOptions,
}

/// State shared by every worker loop of one run.
pub(crate) struct RunState<C> {
    pub(crate) storage: Storage,
    pub(crate) ctx: C,
    pub(crate) reporter: Arc<dyn Reporter>,
    pub(crate) stats: Mutex<RunStats>,
    pub(crate) exit_when_processed: Option<u64>,
    pub(crate) cancel_token: CancellationToken,
}

impl<C> RunState<C> {
    fn record(&self, outcome: AttemptOutcome) {
        let mut stats = self.stats.lock();
        stats.record(outcome);

        if let Some(limit) = self.exit_when_processed
            && stats.processed >= limit
        {
            self.cancel_token.cancel();
        }
    }
}

/// Claims and processes jobs of one queue until the run is cancelled.
pub(crate) async fn run_worker<J, C>(
    state: Arc<RunState<C>>,
    worker: Arc<QueueWorker<J, C>>,
) -> Result<(), CourierError>
where
    J: JobKind,
    C: Clone + Send + Sync + 'static,
{
    tracing::debug!(queue = worker.queue, "Starting worker loop");

    loop {
        if state.cancel_token.is_cancelled() {
            return Ok(());
        }

        let pause = match state
            .storage
            .claim_next(&worker.queue, worker.options.lease)
            .await
        {
            Ok(Some(envelope)) => {
                let outcome = process(&state, &worker, envelope).await;
                state.record(outcome);
                continue;
            }
            Ok(None) => worker.options.poll_interval,
            Err(e) if e.is_store_unavailable() => {
                tracing::warn!(queue = worker.queue, "Store unavailable, backing off: {}", e);
                worker.options.store_backoff
            }
            Err(e) => {
                tracing::error!(queue = worker.queue, "Failed to claim job: {}", e);
                worker.options.store_backoff
            }
        };

        tokio::select! {
            _ = state.cancel_token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

pub(crate) async fn process<J, C>(
    state: &RunState<C>,
    worker: &QueueWorker<J, C>,
    envelope: JobEnvelope,
) -> AttemptOutcome
where
    J: JobKind,
    C: Clone + Send + Sync + 'static,
{
    let job = match J::decode(&envelope.name, envelope.payload.clone()) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(
                job_id = envelope.id,
                queue = envelope.queue,
                job = envelope.name,
                path = e.path,
                "Job payload no longer valid: {}",
                e.reason
            );
            let message = e.to_string();
            let attempts = envelope.meta.attempts + 1;
            report(state, FailureReportKind::Validation, &envelope, attempts, &message);
            return finish_failed(state, envelope, FailureKind::Fatal, &message, false).await;
        }
    };

    tracing::info!(
        job_id = envelope.id,
        queue = envelope.queue,
        job = envelope.name,
        attempt = envelope.meta.attempts + 1,
        latency_ms = envelope.meta.latency_millis(),
        "Job started"
    );

    let context = Context {
        ctx: state.ctx.clone(),
        job_id: envelope.id.clone(),
        queue: envelope.queue.clone(),
        meta: envelope.meta.clone(),
    };

    let start = std::time::Instant::now();
    let Some(result) = run_with_heartbeat(state, worker, &envelope, job, &context).await else {
        tracing::warn!(
            job_id = envelope.id,
            queue = envelope.queue,
            job = envelope.name,
            duration_ms = start.elapsed().as_millis() as u64,
            "Lease lost, job abandoned to its new claim"
        );
        return AttemptOutcome::Abandoned;
    };

    tracing::info!(
        job_id = envelope.id,
        queue = envelope.queue,
        job = envelope.name,
        success = result.is_ok(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Job finished"
    );

    match result {
        Ok(()) => match state.storage.ack(envelope).await {
            Ok(_) => AttemptOutcome::Succeeded,
            Err(CourierError::LeaseLost(job_id)) => {
                tracing::warn!(job_id = job_id, "Lease lost before the job was acknowledged");
                AttemptOutcome::Abandoned
            }
            Err(e) => {
                tracing::error!("Failed to finish job: {}", e);
                AttemptOutcome::Succeeded
            }
        },
        Err((kind, message)) => finish_failed(state, envelope, kind, &message, true).await,
    }
}

/// Runs the handler while extending the lease every third of its duration.
/// Panics become retryable failures.
///
/// Returns `None` once the lease turns out to be held by another claim. The
/// handler is dropped at that point and its result never reaches the store.
async fn run_with_heartbeat<J, C>(
    state: &RunState<C>,
    worker: &QueueWorker<J, C>,
    envelope: &JobEnvelope,
    job: J,
    context: &Context<C>,
) -> Option<Result<(), (FailureKind, String)>>
where
    J: JobKind,
    C: Clone + Send + Sync + 'static,
{
    let execution = AssertUnwindSafe(execute(worker.handler.as_ref(), job, context, envelope))
        .catch_unwind();
    tokio::pin!(execution);

    let mut heartbeat = tokio::time::interval(worker.options.heartbeat_interval());
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut execution => break result,
            _ = heartbeat.tick() => {
                match state.storage.extend_lease(envelope, worker.options.lease).await {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => tracing::warn!(job_id = envelope.id, "Failed to extend lease: {}", e),
                }
            }
        }
    };

    Some(match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((e.kind(), e.to_string())),
        Err(panic) => {
            let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic occurred".to_string()
            };
            Err((FailureKind::Retryable, format!("panic: {panic_msg}")))
        }
    })
}

#[cfg_attr(feature = "tracing-instrument", tracing::instrument(skip_all, name = "job", fields(
    job_id = envelope.id,
    queue = envelope.queue,
    job = envelope.name,
    attempt = envelope.meta.attempts + 1,
    latency_ms = envelope.meta.latency_millis(),
    success,
)))]
async fn execute<J, C>(
    handler: &dyn Handler<J, C>,
    job: J,
    context: &Context<C>,
    #[cfg_attr(not(feature = "tracing-instrument"), allow(unused_variables))]
    envelope: &JobEnvelope,
) -> Result<(), JobError>
where
    J: JobKind,
    C: Clone + Send + Sync + 'static,
{
    #[cfg(feature = "tracing-instrument")]
    let span = tracing::Span::current();

    let result = handler.handle(job, context).await;

    #[cfg(feature = "tracing-instrument")]
    span.record("success", result.is_ok());

    result
}

async fn finish_failed<C>(
    state: &RunState<C>,
    envelope: JobEnvelope,
    kind: FailureKind,
    message: &str,
    report_dead: bool,
) -> AttemptOutcome {
    let job_id = envelope.id.clone();
    let queue = envelope.queue.clone();
    let name = envelope.name.clone();

    match state.storage.fail(envelope, kind, message).await {
        Ok((FailOutcome::RetryScheduled { attempts, available_at }, _)) => {
            tracing::warn!(
                job_id = job_id,
                queue = queue,
                job = name,
                attempts = attempts,
                retry_at = %available_at,
                "Job failed, retry scheduled: {}",
                message
            );
            AttemptOutcome::Retried
        }
        Ok((FailOutcome::Dead { attempts }, envelope)) => {
            tracing::error!(
                job_id = job_id,
                queue = queue,
                job = name,
                attempts = attempts,
                "Job dead: {}",
                message
            );
            if report_dead {
                report(state, FailureReportKind::Dead, &envelope, attempts, message);
            }
            AttemptOutcome::Dead
        }
        Err(CourierError::LeaseLost(_)) => {
            tracing::warn!(
                job_id = job_id,
                queue = queue,
                "Lease lost before the failure was recorded"
            );
            AttemptOutcome::Abandoned
        }
        Err(e) => {
            tracing::error!(job_id = job_id, queue = queue, "Failed to record job failure: {}", e);
            match kind {
                FailureKind::Retryable => AttemptOutcome::Retried,
                FailureKind::Fatal => AttemptOutcome::Dead,
            }
        }
    }
}

fn report<C>(
    state: &RunState<C>,
    kind: FailureReportKind,
    envelope: &JobEnvelope,
    attempts: u32,
    error: &str,
) {
    state.reporter.report(&FailureReport {
        kind,
        job_name: envelope.name.clone(),
        job_id: Some(envelope.id.clone()),
        queue: envelope.queue.clone(),
        attempts,
        error: error.to_string(),
    });
}
