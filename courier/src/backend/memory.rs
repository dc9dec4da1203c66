use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use super::{Backend, QueueCounts, QueueListOpts, RetentionPolicy, WindowAcquire, micros, millis};
use crate::{
    CourierError,
    job_envelope::{JobEnvelope, JobId, JobState},
    repeating::RepeatingJobSpec,
};

struct Lease {
    token: String,
    expires_at: i64,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobEnvelope>,
    queues: BTreeSet<String>,
    /// front = next to claim
    waiting: HashMap<String, VecDeque<JobId>>,
    delayed: HashMap<String, BTreeSet<(i64, JobId)>>,
    active: HashMap<String, HashMap<JobId, Lease>>,
    completed: BTreeSet<(i64, JobId)>,
    dead: BTreeSet<(i64, JobId)>,
    repeating: HashMap<String, BTreeMap<String, RepeatingJobSpec>>,
    /// firing key -> expiry (ms)
    firings: HashMap<String, i64>,
    /// counter key -> (count, window end in ms)
    windows: HashMap<String, (u64, i64)>,
    /// semaphore key -> token -> expiry (ms)
    slots: HashMap<String, HashMap<String, i64>>,
}

/// In-process [`Backend`] for tests and single-process development.
///
/// A single lock guards all state, so every operation is atomic with respect to
/// every other one. Nothing is shared across processes.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn promote_due(&mut self, queue: &str, now: i64) {
        let Some(delayed) = self.delayed.get_mut(queue) else {
            return;
        };
        let mut due = vec![];
        while let Some(first) = delayed.first() {
            if first.0 > now {
                break;
            }
            if let Some((_, id)) = delayed.pop_first() {
                due.push(id);
            }
        }
        for id in &due {
            if let Some(envelope) = self.jobs.get_mut(id) {
                envelope.meta.state = JobState::Waiting;
            }
        }
        if !due.is_empty() {
            self.waiting
                .entry(queue.to_string())
                .or_default()
                .extend(due);
        }
    }

    fn remove_delayed(&mut self, queue: &str, id: &str) -> bool {
        let Some(delayed) = self.delayed.get_mut(queue) else {
            return false;
        };
        let entry = delayed.iter().find(|(_, job_id)| job_id == id).cloned();
        match entry {
            Some(entry) => delayed.remove(&entry),
            None => false,
        }
    }

    /// Drops the lease of `envelope` if its claim still holds it.
    fn release_lease(&mut self, envelope: &JobEnvelope) -> bool {
        let Some(active) = self.active.get_mut(&envelope.queue) else {
            return false;
        };
        match active.get(&envelope.id) {
            Some(lease) if lease.token == envelope.lease_token() => {
                active.remove(&envelope.id);
                true
            }
            _ => false,
        }
    }

    fn envelopes(&self, ids: impl Iterator<Item = JobId>) -> Vec<JobEnvelope> {
        ids.filter_map(|id| self.jobs.get(&id).cloned()).collect()
    }
}

fn prune_set(
    set: &mut BTreeSet<(i64, JobId)>,
    jobs: &mut HashMap<JobId, JobEnvelope>,
    cutoff: i64,
    cap: usize,
) -> usize {
    let mut removed = 0;
    while let Some(first) = set.first() {
        if first.0 > cutoff && set.len() <= cap {
            break;
        }
        if let Some((_, id)) = set.pop_first() {
            jobs.remove(&id);
            removed += 1;
        }
    }
    removed
}

#[async_trait]
impl Backend for MemoryBackend {
    fn namespace(&self) -> &str {
        "memory"
    }

    async fn push(&self, envelope: &JobEnvelope) -> Result<JobId, CourierError> {
        let mut state = self.state.lock();
        state.queues.insert(envelope.queue.clone());
        state.jobs.insert(envelope.id.clone(), envelope.clone());
        match envelope.meta.state {
            JobState::Delayed => {
                state
                    .delayed
                    .entry(envelope.queue.clone())
                    .or_default()
                    .insert((envelope.meta.available_at, envelope.id.clone()));
            }
            _ => {
                state
                    .waiting
                    .entry(envelope.queue.clone())
                    .or_default()
                    .push_back(envelope.id.clone());
            }
        }
        Ok(envelope.id.clone())
    }

    async fn claim_next(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobEnvelope>, CourierError> {
        let mut state = self.state.lock();
        state.promote_due(queue, now.timestamp_micros());

        let expires_at = now.timestamp_micros().saturating_add(micros(lease));
        loop {
            let Some(id) = state.waiting.get_mut(queue).and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let Some(envelope) = state.jobs.remove(&id) else {
                continue;
            };
            let expires = DateTime::<Utc>::from_timestamp_micros(expires_at).unwrap_or(now);
            let token = Uuid::new_v4().to_string();
            let envelope = envelope.claimed(expires, token.clone());
            state.jobs.insert(id.clone(), envelope.clone());
            state
                .active
                .entry(queue.to_string())
                .or_default()
                .insert(id, Lease { token, expires_at });
            return Ok(Some(envelope));
        }
    }

    async fn extend_lease(
        &self,
        envelope: &JobEnvelope,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        let current = state
            .active
            .get_mut(&envelope.queue)
            .and_then(|active| active.get_mut(&envelope.id));
        match current {
            Some(current) if current.token == envelope.lease_token() => {
                current.expires_at = now.timestamp_micros().saturating_add(micros(lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        if !state.release_lease(envelope) {
            return Ok(false);
        }
        let finished_at = envelope
            .meta
            .finished_at
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        state.jobs.insert(envelope.id.clone(), envelope.clone());
        state.completed.insert((finished_at, envelope.id.clone()));
        Ok(true)
    }

    async fn retry(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        if !state.release_lease(envelope) {
            return Ok(false);
        }
        state.jobs.insert(envelope.id.clone(), envelope.clone());
        state
            .delayed
            .entry(envelope.queue.clone())
            .or_default()
            .insert((envelope.meta.available_at, envelope.id.clone()));
        Ok(true)
    }

    async fn kill(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        if !state.release_lease(envelope) {
            return Ok(false);
        }
        let finished_at = envelope
            .meta
            .finished_at
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        state.jobs.insert(envelope.id.clone(), envelope.clone());
        state.dead.insert((finished_at, envelope.id.clone()));
        Ok(true)
    }

    async fn cancel(&self, id: &str) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        let queue = match state.jobs.get(id) {
            Some(envelope) if envelope.meta.state == JobState::Delayed => envelope.queue.clone(),
            _ => return Ok(false),
        };
        if state.remove_delayed(&queue, id) {
            state.jobs.remove(id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, CourierError> {
        let mut state = self.state.lock();
        let now = now.timestamp_micros();
        let mut reclaimed = vec![];
        for (queue, active) in state.active.iter_mut() {
            let expired: Vec<JobId> = active
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                active.remove(&id);
                reclaimed.push((queue.clone(), id));
            }
        }
        for (queue, id) in &reclaimed {
            tracing::info!(job_id = id, queue = queue, "Reclaiming expired lease");
            state
                .waiting
                .entry(queue.clone())
                .or_default()
                .push_front(id.clone());
            if let Some(envelope) = state.jobs.get_mut(id) {
                envelope.meta.state = JobState::Waiting;
            }
        }
        Ok(reclaimed.len())
    }

    async fn prune(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, CourierError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = now.timestamp_micros();
        let completed = prune_set(
            &mut state.completed,
            &mut state.jobs,
            now - micros(retention.completed_age),
            retention.completed_count,
        );
        let dead = prune_set(
            &mut state.dead,
            &mut state.jobs,
            now - micros(retention.dead_age),
            retention.dead_count,
        );
        Ok(completed + dead)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobEnvelope>, CourierError> {
        Ok(self.state.lock().jobs.get(id).cloned())
    }

    async fn list_queue_names(&self) -> Result<Vec<String>, CourierError> {
        Ok(self.state.lock().queues.iter().cloned().collect())
    }

    async fn list_waiting(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        let state = self.state.lock();
        let ids = state
            .waiting
            .get(queue)
            .map(|waiting| {
                waiting
                    .iter()
                    .skip(opts.offset)
                    .take(opts.count)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(state.envelopes(ids.into_iter()))
    }

    async fn list_delayed(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        let state = self.state.lock();
        let ids = state
            .delayed
            .get(queue)
            .map(|delayed| {
                delayed
                    .iter()
                    .skip(opts.offset)
                    .take(opts.count)
                    .map(|(_, id)| id.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(state.envelopes(ids.into_iter()))
    }

    async fn list_dead(&self, opts: &QueueListOpts) -> Result<Vec<JobEnvelope>, CourierError> {
        let state = self.state.lock();
        let ids = state
            .dead
            .iter()
            .rev()
            .skip(opts.offset)
            .take(opts.count)
            .map(|(_, id)| id.clone())
            .collect::<Vec<_>>();
        Ok(state.envelopes(ids.into_iter()))
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, CourierError> {
        let state = self.state.lock();
        Ok(QueueCounts {
            waiting: state.waiting.get(queue).map_or(0, VecDeque::len),
            delayed: state.delayed.get(queue).map_or(0, BTreeSet::len),
            active: state.active.get(queue).map_or(0, HashMap::len),
        })
    }

    async fn completed_count(&self) -> Result<usize, CourierError> {
        Ok(self.state.lock().completed.len())
    }

    async fn dead_count(&self) -> Result<usize, CourierError> {
        Ok(self.state.lock().dead.len())
    }

    async fn save_repeating(&self, spec: &RepeatingJobSpec) -> Result<(), CourierError> {
        let mut state = self.state.lock();
        state.queues.insert(spec.queue.clone());
        state
            .repeating
            .entry(spec.queue.clone())
            .or_default()
            .insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn list_repeating(&self, queue: &str) -> Result<Vec<RepeatingJobSpec>, CourierError> {
        Ok(self
            .state
            .lock()
            .repeating
            .get(queue)
            .map(|specs| specs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_repeating(&self, queue: &str, id: &str) -> Result<bool, CourierError> {
        Ok(self
            .state
            .lock()
            .repeating
            .get_mut(queue)
            .is_some_and(|specs| specs.remove(id).is_some()))
    }

    async fn claim_firing(
        &self,
        spec_id: &str,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        let now_ms = Utc::now().timestamp_millis();
        state.firings.retain(|_, expires_at| *expires_at > now_ms);

        let key = format!("{spec_id}:{}", at.timestamp_micros());
        if state.firings.contains_key(&key) {
            return Ok(false);
        }
        state
            .firings
            .insert(key, now_ms.saturating_add(millis(ttl).max(1)));
        Ok(true)
    }

    async fn window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowAcquire, CourierError> {
        let mut state = self.state.lock();
        let now_ms = now.timestamp_millis();
        let window_ms = millis(window).max(1);

        let entry = state
            .windows
            .entry(key.to_string())
            .or_insert((0, now_ms + window_ms));
        if entry.1 <= now_ms {
            *entry = (0, now_ms + window_ms);
        }

        let granted = entry.0 < limit;
        if granted {
            entry.0 += 1;
        }
        Ok(WindowAcquire {
            granted,
            count: entry.0,
            reset_in: Duration::from_millis((entry.1 - now_ms).max(0) as u64),
        })
    }

    async fn slot_acquire(
        &self,
        key: &str,
        limit: u64,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError> {
        let mut state = self.state.lock();
        let now_ms = now.timestamp_millis();
        let holders = state.slots.entry(key.to_string()).or_default();
        holders.retain(|_, expires_at| *expires_at > now_ms);

        if let Some(expires_at) = holders.get_mut(token) {
            *expires_at = now_ms.saturating_add(millis(ttl));
            return Ok(true);
        }
        if (holders.len() as u64) < limit {
            holders.insert(token.to_string(), now_ms.saturating_add(millis(ttl)));
            return Ok(true);
        }
        Ok(false)
    }

    async fn slot_release(&self, key: &str, token: &str) -> Result<(), CourierError> {
        if let Some(holders) = self.state.lock().slots.get_mut(key) {
            holders.remove(token);
        }
        Ok(())
    }
}
