use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};

use crate::{
    CourierError,
    backend::{Backend, QueueCounts, QueueListOpts, RetentionPolicy},
    job_envelope::{JobEnvelope, JobId},
    repeating::RepeatingJobSpec,
    retry::{self, Disposition, FailureKind},
    stats::{QueueStats, Stats, StatsGlobal},
    storage_builder::StorageBuilder,
};

#[cfg(feature = "prometheus")]
use crate::prometheus::PrometheusMetrics;

/// Result of [`Storage::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The envelope becomes claimable again at `available_at`.
    RetryScheduled {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    Dead { attempts: u32 },
}

/// The durable queue store.
///
/// Every producer, worker and rate limiter goes through this type; the persistence
/// technology behind it is a [`Backend`] chosen when the storage is built.
///
/// # Examples
///
/// ```rust
/// # async fn example() -> Result<(), courier::CourierError> {
/// let storage = courier::Storage::builder().build_in_memory();
///
/// for queue in storage.list_queue_names().await? {
///     println!("{queue}: {:?}", storage.enqueued_count(&queue).await?);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
}

impl Storage {
    /// Creates a new [`StorageBuilder`] for configuring and building a Storage instance.
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub fn from_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn namespace(&self) -> &str {
        self.backend.namespace()
    }

    pub async fn push(&self, envelope: &JobEnvelope) -> Result<JobId, CourierError> {
        tracing::trace!("Pushing job: {:?}", envelope);
        self.backend.push(envelope).await
    }

    /// Claims the next due job of `queue` and leases it for `lease`.
    ///
    /// Returns `None` when nothing is due. No two callers ever receive the same
    /// envelope while its lease is live.
    pub async fn claim_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobEnvelope>, CourierError> {
        self.claim_next_at(queue, lease, Utc::now()).await
    }

    pub(crate) async fn claim_next_at(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobEnvelope>, CourierError> {
        self.backend.claim_next(queue, lease, now).await
    }

    pub async fn extend_lease(
        &self,
        envelope: &JobEnvelope,
        lease: Duration,
    ) -> Result<bool, CourierError> {
        self.backend.extend_lease(envelope, lease, Utc::now()).await
    }

    /// Marks a claimed envelope as completed.
    ///
    /// Fails with [`CourierError::LeaseLost`] when the lease expired and the job
    /// was claimed again; the store is left untouched in that case.
    pub async fn ack(&self, envelope: JobEnvelope) -> Result<JobEnvelope, CourierError> {
        let envelope = envelope.completed(Utc::now());
        if !self.backend.ack(&envelope).await? {
            return Err(CourierError::LeaseLost(envelope.id));
        }
        Ok(envelope)
    }

    /// Records a failed attempt of a claimed envelope and either schedules the
    /// next attempt with backoff or moves the envelope to the dead set.
    pub async fn fail(
        &self,
        envelope: JobEnvelope,
        kind: FailureKind,
        error: &str,
    ) -> Result<(FailOutcome, JobEnvelope), CourierError> {
        self.fail_at(envelope, kind, error, Utc::now()).await
    }

    pub(crate) async fn fail_at(
        &self,
        envelope: JobEnvelope,
        kind: FailureKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(FailOutcome, JobEnvelope), CourierError> {
        let envelope = envelope.with_attempt_failed(error);
        let attempts = envelope.meta.attempts;

        match retry::decide(
            attempts,
            envelope.meta.max_attempts,
            &envelope.meta.backoff,
            kind,
        ) {
            Disposition::Retry { delay } => {
                let available_at =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let envelope = envelope.rescheduled(available_at, now);
                if !self.backend.retry(&envelope).await? {
                    return Err(CourierError::LeaseLost(envelope.id));
                }
                Ok((
                    FailOutcome::RetryScheduled {
                        attempts,
                        available_at,
                    },
                    envelope,
                ))
            }
            Disposition::Dead => {
                let envelope = envelope.dead(now);
                if !self.backend.kill(&envelope).await? {
                    return Err(CourierError::LeaseLost(envelope.id));
                }
                Ok((FailOutcome::Dead { attempts }, envelope))
            }
        }
    }

    /// Removes a delayed job before it becomes due.
    ///
    /// Returns `false` when the job is unknown or no longer delayed; a job that is
    /// already waiting or running cannot be cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, CourierError> {
        let cancelled = self.backend.cancel(job_id).await?;
        if cancelled {
            tracing::info!(job_id = job_id, "Delayed job cancelled");
        }
        Ok(cancelled)
    }

    /// Makes jobs whose lease has expired claimable again.
    pub async fn reclaim_expired(&self) -> Result<usize, CourierError> {
        self.backend.reclaim_expired(Utc::now()).await
    }

    /// Prunes finished jobs that fall outside `retention`.
    pub async fn prune(&self, retention: &RetentionPolicy) -> Result<usize, CourierError> {
        let pruned = self.backend.prune(retention, Utc::now()).await?;
        if pruned > 0 {
            tracing::info!("Pruned {pruned} finished jobs");
        }
        Ok(pruned)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobEnvelope>, CourierError> {
        self.backend.get_job(job_id).await
    }

    /// Every queue that has received a job or a repeating schedule.
    pub async fn list_queue_names(&self) -> Result<Vec<String>, CourierError> {
        self.backend.list_queue_names().await
    }

    pub async fn list_waiting(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        self.backend.list_waiting(queue, opts).await
    }

    /// Jobs of `queue` that are not due yet, soonest first.
    pub async fn list_delayed(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        self.backend.list_delayed(queue, opts).await
    }

    /// Dead jobs, most recent first.
    pub async fn list_dead(&self, opts: &QueueListOpts) -> Result<Vec<JobEnvelope>, CourierError> {
        self.backend.list_dead(opts).await
    }

    /// Waiting, delayed and active counts of `queue`.
    pub async fn enqueued_count(&self, queue: &str) -> Result<QueueCounts, CourierError> {
        self.backend.queue_counts(queue).await
    }

    pub async fn dead_count(&self) -> Result<usize, CourierError> {
        self.backend.dead_count().await
    }

    pub async fn completed_count(&self) -> Result<usize, CourierError> {
        self.backend.completed_count().await
    }

    pub async fn stats(&self) -> Result<Stats, CourierError> {
        let mut stats = Stats {
            global: StatsGlobal {
                completed: self.backend.completed_count().await?,
                dead: self.backend.dead_count().await?,
                ..Default::default()
            },
            queues: vec![],
        };

        for queue in self.list_queue_names().await? {
            let counts = self.backend.queue_counts(&queue).await?;
            let repeating = self.backend.list_repeating(&queue).await?.len();

            stats.global.waiting += counts.waiting;
            stats.global.delayed += counts.delayed;
            stats.global.active += counts.active;
            stats.queues.push(QueueStats {
                queue,
                waiting: counts.waiting,
                delayed: counts.delayed,
                active: counts.active,
                repeating,
            });
        }

        Ok(stats)
    }

    /// Stores a repeating schedule, replacing any spec with the same id.
    ///
    /// The payload is not validated here; use
    /// [`Producer::schedule_repeating`](crate::Producer::schedule_repeating) for that.
    pub async fn schedule_repeating(&self, spec: &RepeatingJobSpec) -> Result<(), CourierError> {
        spec.schedule()?;
        spec.tz()?;
        self.backend.save_repeating(spec).await?;
        tracing::info!(
            spec = spec.id,
            queue = spec.queue,
            pattern = spec.pattern,
            "Repeating job scheduled"
        );
        Ok(())
    }

    pub async fn list_scheduled_jobs(
        &self,
        queue: &str,
    ) -> Result<Vec<RepeatingJobSpec>, CourierError> {
        self.backend.list_repeating(queue).await
    }

    pub async fn remove_scheduled_job(&self, queue: &str, id: &str) -> Result<bool, CourierError> {
        self.backend.remove_repeating(queue, id).await
    }

    pub(crate) async fn claim_firing(
        &self,
        spec_id: &str,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        self.backend.claim_firing(spec_id, at, ttl).await
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns Prometheus metrics based on the current stats.
    ///
    /// ```rust,ignore
    /// let metrics = storage.metrics().await?;
    /// println!("{}", metrics.encode_to_string()?);
    /// ```
    #[cfg(feature = "prometheus")]
    pub async fn metrics(&self) -> Result<PrometheusMetrics, CourierError> {
        let stats = self.stats().await?;
        Ok(PrometheusMetrics::from_stats(&stats))
    }
}
