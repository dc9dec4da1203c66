use std::time::Duration;

use crate::job_envelope::Backoff;

/// Whether a failure may be retried at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// What happens to an envelope after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { delay: Duration },
    Dead,
}

/// Decides the fate of a failed attempt. `attempts` counts the attempt that just
/// failed.
pub fn decide(attempts: u32, max_attempts: u32, backoff: &Backoff, kind: FailureKind) -> Disposition {
    match kind {
        FailureKind::Fatal => Disposition::Dead,
        FailureKind::Retryable if attempts >= max_attempts => Disposition::Dead,
        FailureKind::Retryable => Disposition::Retry {
            delay: backoff.delay(attempts),
        },
    }
}
