use chrono::Utc;
use std::sync::Arc;

use crate::{
    CourierError, JobKind, Registry,
    job_envelope::{EnqueueOptions, JobEnvelope, JobId},
    job_kind::queue_name_for,
    repeating::RepeatingJobSpec,
    reporter::{FailureReport, FailureReportKind, Reporter, TracingReporter},
};

/// Hands work off to the queues.
///
/// [`enqueue`](Producer::enqueue) never returns an error: bad payloads and store
/// outages are sent to the [`Reporter`] and the caller carries on. Use
/// [`try_enqueue`](Producer::try_enqueue) where the error matters.
pub struct Producer<J: JobKind> {
    registry: Arc<Registry<J>>,
    reporter: Arc<dyn Reporter>,
}

impl<J: JobKind> Clone for Producer<J> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            reporter: Arc::clone(&self.reporter),
        }
    }
}

impl<J: JobKind> Producer<J> {
    pub fn new(registry: Arc<Registry<J>>) -> Self {
        Self {
            registry,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn registry(&self) -> &Arc<Registry<J>> {
        &self.registry
    }

    /// Validates and enqueues `payload` as `job_name`, reporting any failure.
    ///
    /// Returns the id of the stored job, or `None` when nothing was enqueued.
    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Option<JobId> {
        match self.try_enqueue(job_name, payload, options).await {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                self.report_enqueue_failure(job_name, &e);
                None
            }
        }
    }

    /// Like [`enqueue`](Producer::enqueue) but hands the error back to the caller.
    pub async fn try_enqueue(
        &self,
        job_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, CourierError> {
        let job = self.registry.validate(job_name, payload)?;
        self.push(&job, options, None).await
    }

    /// Enqueues an already typed job.
    pub async fn enqueue_job(&self, job: &J, options: EnqueueOptions) -> Option<JobId> {
        match self.push(job, options, None).await {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                self.report_enqueue_failure(job.name(), &e);
                None
            }
        }
    }

    /// Validates the payload of `spec` and stores the schedule.
    pub async fn schedule_repeating(&self, spec: &RepeatingJobSpec) -> Result<(), CourierError> {
        self.registry
            .validate(&spec.job_name, spec.payload.clone())?;
        self.registry.storage().schedule_repeating(spec).await
    }

    pub(crate) async fn enqueue_repeat(
        &self,
        spec: &RepeatingJobSpec,
        options: EnqueueOptions,
    ) -> Option<JobId> {
        let result = match self.registry.validate(&spec.job_name, spec.payload.clone()) {
            Ok(job) => self.push(&job, options, Some(spec.id.clone())).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                self.report_enqueue_failure(&spec.job_name, &e);
                None
            }
        }
    }

    async fn push(
        &self,
        job: &J,
        options: EnqueueOptions,
        repeat_id: Option<String>,
    ) -> Result<JobId, CourierError> {
        let queue = self.registry.queue(job.queue_name());
        let mut envelope = JobEnvelope::new(
            queue.name(),
            job.name(),
            job.payload()?,
            &options,
            self.registry.defaults(),
            Utc::now(),
        );
        envelope.meta.repeat_id = repeat_id;

        let job_id = queue.push(&envelope).await?;
        tracing::debug!(
            job_id = job_id,
            queue = envelope.queue,
            job = envelope.name,
            state = ?envelope.meta.state,
            "Job enqueued"
        );
        Ok(job_id)
    }

    fn report_enqueue_failure(&self, job_name: &str, error: &CourierError) {
        let kind = match error {
            CourierError::Validation(_) => FailureReportKind::Validation,
            _ => FailureReportKind::Enqueue,
        };
        tracing::warn!(job = job_name, "Job not enqueued: {}", error);
        self.reporter.report(&FailureReport {
            kind,
            job_name: job_name.to_string(),
            job_id: None,
            queue: queue_name_for(job_name).to_string(),
            attempts: 0,
            error: error.to_string(),
        });
    }
}
