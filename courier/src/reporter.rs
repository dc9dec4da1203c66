//! Observability sink for failures that never reach the caller.
//!
//! Enqueue never fails the request that triggered it and dead jobs have nobody
//! waiting on them, so both end up here instead.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::job_envelope::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReportKind {
    /// Payload rejected at enqueue or consume time.
    Validation,
    /// Job could not be written to the store.
    Enqueue,
    /// Job exhausted its attempts or failed fatally.
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: FailureReportKind,
    pub job_name: String,
    /// Absent when the job never made it into the store.
    pub job_id: Option<JobId>,
    pub queue: String,
    pub attempts: u32,
    pub error: String,
}

pub trait Reporter: Send + Sync {
    fn report(&self, report: &FailureReport);
}

/// Logs every report at error level. Used when nothing else is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: &FailureReport) {
        tracing::error!(
            kind = ?report.kind,
            job = report.job_name,
            job_id = report.job_id.as_deref().unwrap_or("-"),
            queue = report.queue,
            attempts = report.attempts,
            error = report.error,
            "Job failure reported"
        );
    }
}

/// Keeps every report in memory, for tests and dashboards.
#[derive(Debug, Clone, Default)]
pub struct CollectingReporter {
    reports: Arc<Mutex<Vec<FailureReport>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, report: &FailureReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Sends every report to Sentry as an error event tagged with the job identity.
#[cfg(feature = "sentry")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SentryReporter;

#[cfg(feature = "sentry")]
impl Reporter for SentryReporter {
    fn report(&self, report: &FailureReport) {
        sentry_core::with_scope(
            |scope| {
                scope.set_tag("job", &report.job_name);
                scope.set_tag("queue", &report.queue);
                scope.set_extra("job_id", report.job_id.clone().into());
                scope.set_extra("attempts", report.attempts.into());
                scope.set_extra("kind", format!("{:?}", report.kind).into());
            },
            || {
                sentry_core::capture_message(
                    &format!("{}: {}", report.job_name, report.error),
                    sentry_core::Level::Error,
                )
            },
        );
    }
}
