/// Centralizes the Redis key naming scheme used by `RedisBackend`.
#[derive(Debug, Clone)]
pub(crate) struct StorageKeys {
    /// Normalized namespace prefix applied to every Redis key
    /// (e.g. `courier` or `courier:<custom>`).
    pub(crate) namespace: String,
    /// Redis hash that stores serialized `JobEnvelope` values keyed by `JobId`.
    pub(crate) jobs: String,
    /// Redis set of every queue name that has ever received a job.
    pub(crate) queues: String,
    /// Sorted set (ZSET) of completed job IDs scored by completion time in microseconds.
    pub(crate) completed: String,
    /// Sorted set (ZSET) of dead job IDs scored by the time they died in microseconds.
    pub(crate) dead: String,
    /// Prefix for Redis lists of claimable job IDs (`{waiting_prefix}:<queue>`).
    /// Producers push on the left, workers pop on the right.
    pub(crate) waiting_prefix: String,
    /// Prefix for sorted sets of delayed job IDs scored by `available_at`
    /// (`{delayed_prefix}:<queue>`).
    pub(crate) delayed_prefix: String,
    /// Prefix for sorted sets of leased job IDs scored by lease expiry
    /// (`{active_prefix}:<queue>`).
    pub(crate) active_prefix: String,
    /// Prefix for hashes of lease tokens keyed by leased job ID
    /// (`{lease_prefix}:<queue>`).
    pub(crate) lease_prefix: String,
    /// Prefix for hashes of repeating job specs keyed by spec id
    /// (`{repeat_prefix}:<queue>`).
    pub(crate) repeat_prefix: String,
    /// Prefix for short-lived keys that dedupe repeating job firings
    /// (`{firing_prefix}:<spec>:<timestamp>`).
    pub(crate) firing_prefix: String,
    /// Prefix for fixed window rate limit counters (`{window_prefix}:<key>`).
    pub(crate) window_prefix: String,
    /// Prefix for sorted sets of semaphore holders scored by expiry
    /// (`{slots_prefix}:<key>`).
    pub(crate) slots_prefix: String,
}

impl StorageKeys {
    /// Builds a namespaced collection of Redis keys, defaulting to the `courier`
    /// namespace when none is provided.
    pub(crate) fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            "courier".to_string()
        } else {
            format!("courier:{namespace}")
        };

        Self {
            jobs: format!("{namespace}:jobs"),
            queues: format!("{namespace}:queues"),
            completed: format!("{namespace}:completed"),
            dead: format!("{namespace}:dead"),
            waiting_prefix: format!("{namespace}:waiting"),
            delayed_prefix: format!("{namespace}:delayed"),
            active_prefix: format!("{namespace}:active"),
            lease_prefix: format!("{namespace}:lease"),
            repeat_prefix: format!("{namespace}:repeat"),
            firing_prefix: format!("{namespace}:firing"),
            window_prefix: format!("{namespace}:window"),
            slots_prefix: format!("{namespace}:slots"),
            namespace,
        }
    }

    pub(crate) fn waiting(&self, queue: &str) -> String {
        format!("{}:{}", self.waiting_prefix, queue)
    }

    pub(crate) fn delayed(&self, queue: &str) -> String {
        format!("{}:{}", self.delayed_prefix, queue)
    }

    pub(crate) fn active(&self, queue: &str) -> String {
        format!("{}:{}", self.active_prefix, queue)
    }

    pub(crate) fn leases(&self, queue: &str) -> String {
        format!("{}:{}", self.lease_prefix, queue)
    }

    pub(crate) fn repeat(&self, queue: &str) -> String {
        format!("{}:{}", self.repeat_prefix, queue)
    }

    pub(crate) fn firing(&self, spec_id: &str, at_micros: i64) -> String {
        format!("{}:{}:{}", self.firing_prefix, spec_id, at_micros)
    }

    pub(crate) fn window(&self, key: &str) -> String {
        format!("{}:{}", self.window_prefix, key)
    }

    pub(crate) fn slots(&self, key: &str) -> String {
        format!("{}:{}", self.slots_prefix, key)
    }
}
