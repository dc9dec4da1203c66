//! The durable queue store contract.
//!
//! Everything outside this module talks to persistence through [`Backend`], so a
//! Redis deployment and the in-process store used by tests share the producer,
//! worker and rate limiter code unchanged.

mod memory;
mod redis;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    CourierError,
    job_envelope::{JobEnvelope, JobId},
    repeating::RepeatingJobSpec,
};

/// Pagination for listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueListOpts {
    /// Maximum number of jobs to return.
    pub count: usize,
    /// Number of jobs to skip from the start.
    pub offset: usize,
}

impl Default for QueueListOpts {
    fn default() -> Self {
        Self {
            count: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
}

/// Result of one attempt to take a unit from a windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAcquire {
    pub granted: bool,
    /// Count in the current window after this attempt.
    pub count: u64,
    /// Time until the current window rolls over.
    pub reset_in: Duration,
}

/// How long finished envelopes are kept for inspection.
///
/// A record is pruned once it is older than the age limit or pushes its list past
/// the count cap, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_count: usize,
    pub dead_age: Duration,
    pub dead_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(24 * 3600),
            completed_count: 1000,
            dead_age: Duration::from_secs(7 * 24 * 3600),
            dead_count: 5000,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn namespace(&self) -> &str;

    /// Persists a new envelope as waiting or delayed, according to its state.
    async fn push(&self, envelope: &JobEnvelope) -> Result<JobId, CourierError>;

    /// Atomically takes the next due envelope of `queue` and leases it until
    /// `now + lease`. Concurrent callers never receive the same envelope.
    async fn claim_next(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobEnvelope>, CourierError>;

    /// Pushes the lease of an active envelope forward. Returns `false` when the
    /// claim behind `envelope` no longer holds the lease.
    async fn extend_lease(
        &self,
        envelope: &JobEnvelope,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError>;

    /// Stores a completed envelope and releases its lease.
    ///
    /// `ack`, `retry` and `kill` only act while the claim behind `envelope` still
    /// holds the lease, and return `false` without writing anything otherwise.
    async fn ack(&self, envelope: &JobEnvelope) -> Result<bool, CourierError>;

    /// Stores a failed envelope and makes it claimable again at its `available_at`.
    async fn retry(&self, envelope: &JobEnvelope) -> Result<bool, CourierError>;

    /// Stores a dead envelope and releases its lease.
    async fn kill(&self, envelope: &JobEnvelope) -> Result<bool, CourierError>;

    /// Removes a delayed envelope. Returns `false` when the job is not delayed.
    async fn cancel(&self, id: &str) -> Result<bool, CourierError>;

    /// Returns envelopes whose lease expired before `now` to their queue.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, CourierError>;

    /// Drops finished envelopes according to `retention`.
    async fn prune(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, CourierError>;

    async fn get_job(&self, id: &str) -> Result<Option<JobEnvelope>, CourierError>;

    async fn list_queue_names(&self) -> Result<Vec<String>, CourierError>;

    async fn list_waiting(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError>;

    async fn list_delayed(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError>;

    /// Dead envelopes, newest first.
    async fn list_dead(&self, opts: &QueueListOpts) -> Result<Vec<JobEnvelope>, CourierError>;

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, CourierError>;

    async fn completed_count(&self) -> Result<usize, CourierError>;

    async fn dead_count(&self) -> Result<usize, CourierError>;

    async fn save_repeating(&self, spec: &RepeatingJobSpec) -> Result<(), CourierError>;

    async fn list_repeating(&self, queue: &str) -> Result<Vec<RepeatingJobSpec>, CourierError>;

    async fn remove_repeating(&self, queue: &str, id: &str) -> Result<bool, CourierError>;

    /// Claims the right to fire `spec_id` at `at`. Only the first caller for a given
    /// pair gets `true`.
    async fn claim_firing(
        &self,
        spec_id: &str,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CourierError>;

    /// Takes one unit from the fixed window counter `key` if it has capacity.
    async fn window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowAcquire, CourierError>;

    /// Takes one slot of the semaphore `key` for `token`. Slots not released
    /// within `ttl` are considered abandoned and freed.
    async fn slot_acquire(
        &self,
        key: &str,
        limit: u64,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError>;

    async fn slot_release(&self, key: &str, token: &str) -> Result<(), CourierError>;
}

pub(crate) fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_envelope::{EnqueueOptions, JobDefaults, JobState};
    use crate::test_helper::{random_string, redis_pool};
    use serde_json::json;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);

    /// The in-memory backend always, plus Redis when `REDIS_URL` is set.
    fn backends() -> Vec<Arc<dyn Backend>> {
        let mut backends: Vec<Arc<dyn Backend>> = vec![Arc::new(MemoryBackend::new())];
        if let Some(pool) = redis_pool() {
            backends.push(Arc::new(RedisBackend::new(pool, Some(random_string()))));
        }
        backends
    }

    fn envelope(queue: &str, options: &EnqueueOptions, now: DateTime<Utc>) -> JobEnvelope {
        JobEnvelope::new(
            queue,
            format!("{queue}.job"),
            json!({"n": 1}),
            options,
            &JobDefaults::default(),
            now,
        )
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        for backend in backends() {
            let now = Utc::now();
            let job = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&job).await.unwrap();

            let (a, b) = tokio::join!(
                backend.claim_next("mail", LEASE, now),
                backend.claim_next("mail", LEASE, now)
            );
            let claimed: Vec<JobEnvelope> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

            assert_eq!(claimed.len(), 1, "backend {}", backend.namespace());
            assert_eq!(claimed[0].id, job.id);
            assert_eq!(claimed[0].payload, json!({"n": 1}));
            assert_eq!(claimed[0].meta.state, JobState::Active);
            assert_eq!(backend.queue_counts("mail").await.unwrap().active, 1);
        }
    }

    #[tokio::test]
    async fn test_claim_order_is_fifo_for_waiting_jobs() {
        for backend in backends() {
            let now = Utc::now();
            let first = envelope("mail", &EnqueueOptions::default(), now);
            let second = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&first).await.unwrap();
            backend.push(&second).await.unwrap();

            let claimed = backend.claim_next("mail", LEASE, now).await.unwrap().unwrap();
            assert_eq!(claimed.id, first.id);
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        for backend in backends() {
            let now = Utc::now();
            let job = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&job).await.unwrap();
            let claimed = backend
                .claim_next("mail", Duration::from_secs(1), now)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(backend.reclaim_expired(now).await.unwrap(), 0);
            assert!(backend.claim_next("mail", LEASE, now).await.unwrap().is_none());

            let later = now + chrono::Duration::seconds(2);
            assert_eq!(backend.reclaim_expired(later).await.unwrap(), 1);
            assert!(!backend.extend_lease(&claimed, LEASE, later).await.unwrap());

            let again = backend.claim_next("mail", LEASE, later).await.unwrap().unwrap();
            assert_eq!(again.id, job.id);
        }
    }

    #[tokio::test]
    async fn test_extended_lease_is_not_reclaimed() {
        for backend in backends() {
            let now = Utc::now();
            let job = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&job).await.unwrap();
            let claimed = backend
                .claim_next("mail", Duration::from_secs(1), now)
                .await
                .unwrap()
                .unwrap();

            let later = now + chrono::Duration::milliseconds(800);
            assert!(backend.extend_lease(&claimed, LEASE, later).await.unwrap());
            let much_later = now + chrono::Duration::seconds(5);
            assert_eq!(backend.reclaim_expired(much_later).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_touch_reclaimed_job() {
        for backend in backends() {
            let now = Utc::now();
            let job = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&job).await.unwrap();
            let stale = backend
                .claim_next("mail", Duration::from_secs(1), now)
                .await
                .unwrap()
                .unwrap();

            let later = now + chrono::Duration::seconds(2);
            assert_eq!(backend.reclaim_expired(later).await.unwrap(), 1);
            let current = backend.claim_next("mail", LEASE, later).await.unwrap().unwrap();
            assert_ne!(stale.meta.lease_token, current.meta.lease_token);

            assert!(!backend.extend_lease(&stale, LEASE, later).await.unwrap());
            assert!(!backend.ack(&stale.clone().completed(later)).await.unwrap());
            assert!(
                !backend
                    .kill(&stale.clone().with_attempt_failed("late").dead(later))
                    .await
                    .unwrap()
            );
            assert_eq!(backend.completed_count().await.unwrap(), 0);
            assert_eq!(backend.dead_count().await.unwrap(), 0);
            assert_eq!(backend.queue_counts("mail").await.unwrap().active, 1);

            let retry_at = later + chrono::Duration::seconds(5);
            let failed = current
                .with_attempt_failed("boom")
                .rescheduled(retry_at, later);
            assert!(backend.retry(&failed).await.unwrap());

            let stored = backend.get_job(&job.id).await.unwrap().unwrap();
            assert_eq!(stored.meta.state, JobState::Delayed);
            assert_eq!(stored.meta.attempts, 1);
            let counts = backend.queue_counts("mail").await.unwrap();
            assert_eq!((counts.active, counts.delayed), (0, 1));
        }
    }

    #[tokio::test]
    async fn test_due_and_reclaimed_jobs_are_recorded_waiting() {
        for backend in backends() {
            let now = Utc::now();
            let delayed = EnqueueOptions::default().delay_ms(1000);
            let first = envelope("mail", &delayed, now);
            let second = envelope("mail", &delayed, now);
            backend.push(&first).await.unwrap();
            backend.push(&second).await.unwrap();

            let due = now + chrono::Duration::seconds(2);
            let claimed = backend
                .claim_next("mail", Duration::from_secs(1), due)
                .await
                .unwrap()
                .unwrap();
            let promoted = if claimed.id == first.id { &second } else { &first };
            let stored = backend.get_job(&promoted.id).await.unwrap().unwrap();
            assert_eq!(stored.meta.state, JobState::Waiting);
            assert_eq!(stored.payload, json!({"n": 1}));

            let expired = due + chrono::Duration::seconds(2);
            assert_eq!(backend.reclaim_expired(expired).await.unwrap(), 1);
            let stored = backend.get_job(&claimed.id).await.unwrap().unwrap();
            assert_eq!(stored.meta.state, JobState::Waiting);
        }
    }

    #[tokio::test]
    async fn test_prune_by_count() {
        for backend in backends() {
            let now = Utc::now();
            for _ in 0..3 {
                let job = envelope("mail", &EnqueueOptions::default(), now);
                backend.push(&job).await.unwrap();
                let claimed = backend.claim_next("mail", LEASE, now).await.unwrap().unwrap();
                assert!(backend.ack(&claimed.completed(now)).await.unwrap());
            }

            let retention = RetentionPolicy {
                completed_count: 1,
                ..Default::default()
            };
            assert_eq!(backend.prune(&retention, now).await.unwrap(), 2);
            assert_eq!(backend.completed_count().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_prune_by_age() {
        for backend in backends() {
            let now = Utc::now();
            let job = envelope("mail", &EnqueueOptions::default(), now);
            backend.push(&job).await.unwrap();
            let claimed = backend.claim_next("mail", LEASE, now).await.unwrap().unwrap();
            assert!(
                backend
                    .kill(&claimed.with_attempt_failed("boom").dead(now))
                    .await
                    .unwrap()
            );

            let retention = RetentionPolicy::default();
            assert_eq!(backend.prune(&retention, now).await.unwrap(), 0);

            let next_week = now + chrono::Duration::days(8);
            assert_eq!(backend.prune(&retention, next_week).await.unwrap(), 1);
            assert_eq!(backend.dead_count().await.unwrap(), 0);
            assert!(backend.get_job(&job.id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_list_pagination() {
        for backend in backends() {
            let now = Utc::now();
            for _ in 0..5 {
                let job = envelope("mail", &EnqueueOptions::default().delay_ms(1000), now);
                backend.push(&job).await.unwrap();
            }

            let page = QueueListOpts {
                count: 2,
                offset: 1,
            };
            assert_eq!(backend.list_delayed("mail", &page).await.unwrap().len(), 2);
            let empty = QueueListOpts {
                count: 0,
                offset: 0,
            };
            assert!(backend.list_delayed("mail", &empty).await.unwrap().is_empty());
            assert_eq!(backend.list_queue_names().await.unwrap(), vec!["mail".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_window_acquire() {
        for backend in backends() {
            let now = Utc::now();
            let window = Duration::from_secs(60);
            let key = random_string();

            assert!(backend.window_acquire(&key, 2, window, now).await.unwrap().granted);
            assert!(backend.window_acquire(&key, 2, window, now).await.unwrap().granted);
            let third = backend.window_acquire(&key, 2, window, now).await.unwrap();
            assert!(!third.granted);
            assert_eq!(third.count, 2);
            assert!(third.reset_in <= window);
            assert!(third.reset_in > Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_slots() {
        for backend in backends() {
            let now = Utc::now();
            let ttl = Duration::from_secs(60);
            let key = random_string();

            assert!(backend.slot_acquire(&key, 2, "a", ttl, now).await.unwrap());
            assert!(backend.slot_acquire(&key, 2, "b", ttl, now).await.unwrap());
            assert!(!backend.slot_acquire(&key, 2, "c", ttl, now).await.unwrap());

            backend.slot_release(&key, "a").await.unwrap();
            assert!(backend.slot_acquire(&key, 2, "c", ttl, now).await.unwrap());

            let after_ttl = now + chrono::Duration::seconds(61);
            assert!(backend.slot_acquire(&key, 2, "d", ttl, after_ttl).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_reacquiring_a_slot_renews_it() {
        for backend in backends() {
            let now = Utc::now();
            let ttl = Duration::from_secs(60);
            let key = random_string();

            assert!(backend.slot_acquire(&key, 1, "a", ttl, now).await.unwrap());
            let renewed_at = now + chrono::Duration::seconds(50);
            assert!(backend.slot_acquire(&key, 1, "a", ttl, renewed_at).await.unwrap());

            let past_first_ttl = now + chrono::Duration::seconds(70);
            assert!(!backend.slot_acquire(&key, 1, "b", ttl, past_first_ttl).await.unwrap());

            let past_renewed_ttl = now + chrono::Duration::seconds(111);
            assert!(backend.slot_acquire(&key, 1, "b", ttl, past_renewed_ttl).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_claim_firing_once() {
        for backend in backends() {
            let at = Utc::now();
            let ttl = Duration::from_secs(60);
            let spec = random_string();

            assert!(backend.claim_firing(&spec, at, ttl).await.unwrap());
            assert!(!backend.claim_firing(&spec, at, ttl).await.unwrap());
            let next = at + chrono::Duration::minutes(1);
            assert!(backend.claim_firing(&spec, next, ttl).await.unwrap());
        }
    }
}
