use parking_lot::Mutex;
use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use crate::{
    CourierError, JobKind, Storage,
    backend::QueueCounts,
    job_envelope::{JobDefaults, JobEnvelope, JobId},
    job_kind::queue_name_for,
    validation::ValidationError,
};

/// Handle to one queue of the store, shared by everything that produces into it.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    storage: Storage,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(&self, envelope: &JobEnvelope) -> Result<JobId, CourierError> {
        self.storage.push(envelope).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, CourierError> {
        self.storage.enqueued_count(&self.name).await
    }
}

/// The job catalog `J` bound to a store.
///
/// Built once at startup and shared (behind an [`Arc`]) by producers and workers.
/// Queue handles are created on first use and reused afterwards.
pub struct Registry<J: JobKind> {
    storage: Storage,
    defaults: JobDefaults,
    queues: Mutex<HashMap<String, Arc<QueueHandle>>>,
    _catalog: PhantomData<fn() -> J>,
}

impl<J: JobKind> Registry<J> {
    pub fn new(storage: &Storage) -> Self {
        Self {
            storage: storage.clone(),
            defaults: JobDefaults::default(),
            queues: Mutex::new(HashMap::new()),
            _catalog: PhantomData,
        }
    }

    /// Attempt budget and backoff for jobs enqueued without explicit options.
    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Checks `payload` against the schema registered under `job_name`.
    pub fn validate(&self, job_name: &str, payload: serde_json::Value) -> Result<J, ValidationError> {
        J::decode(job_name, payload)
    }

    pub fn contains(&self, job_name: &str) -> bool {
        J::NAMES.contains(&job_name)
    }

    /// Handle to the queue `name`, created on first request.
    pub fn queue(&self, name: &str) -> Arc<QueueHandle> {
        let mut queues = self.queues.lock();
        if let Some(handle) = queues.get(name) {
            return Arc::clone(handle);
        }

        tracing::debug!(queue = name, "Opening queue handle");
        let handle = Arc::new(QueueHandle {
            name: name.to_string(),
            storage: self.storage.clone(),
        });
        queues.insert(name.to_string(), Arc::clone(&handle));
        handle
    }

    /// Every queue the catalog routes to, sorted and without duplicates.
    pub fn queue_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = J::NAMES.iter().copied().map(queue_name_for).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
