//! Stats types for queue monitoring.

use serde::Serialize;

/// Snapshot of the whole namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Global aggregate statistics.
    pub global: StatsGlobal,
    /// Per-queue statistics, sorted by queue name.
    pub queues: Vec<QueueStats>,
}

/// Global aggregate statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsGlobal {
    /// Jobs waiting to be claimed across all queues.
    pub waiting: usize,
    /// Jobs not yet due across all queues.
    pub delayed: usize,
    /// Jobs currently leased by a worker.
    pub active: usize,
    /// Completed jobs still retained.
    pub completed: usize,
    /// Dead jobs still retained.
    pub dead: usize,
}

/// Statistics for a specific queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    /// Number of repeating schedules attached to the queue.
    pub repeating: usize,
}

/// Outcome counters of one [`run`](crate::run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Attempts finished, whatever the outcome.
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that failed and were scheduled again.
    pub retried: u64,
    /// Attempts that moved their job to the dead set.
    pub dead: u64,
    /// Attempts dropped because their lease passed to another claim.
    pub abandoned: u64,
}

/// How one processed attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Succeeded,
    Retried,
    Dead,
    Abandoned,
}

impl RunStats {
    pub(crate) fn record(&mut self, outcome: AttemptOutcome) {
        self.processed += 1;
        match outcome {
            AttemptOutcome::Succeeded => self.succeeded += 1,
            AttemptOutcome::Retried => self.retried += 1,
            AttemptOutcome::Dead => self.dead += 1,
            AttemptOutcome::Abandoned => self.abandoned += 1,
        }
    }
}
