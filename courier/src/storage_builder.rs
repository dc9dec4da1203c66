use std::{sync::Arc, time::Duration};

use crate::{
    CourierError, Storage,
    backend::{MemoryBackend, RedisBackend},
};

/// Connection pool timeouts used when the builder creates the Redis pool itself.
#[derive(Debug, Clone, Copy)]
pub struct StorageBuilderTimeouts {
    pub wait: Option<Duration>,
    pub create: Option<Duration>,
    pub recycle: Option<Duration>,
}

impl Default for StorageBuilderTimeouts {
    fn default() -> Self {
        Self {
            wait: Some(Duration::from_secs(2)),
            create: Some(Duration::from_secs(2)),
            recycle: Some(Duration::from_secs(2)),
        }
    }
}

/// Builds a [`Storage`].
///
/// ```rust,no_run
/// # fn example() -> Result<(), courier::CourierError> {
/// let storage = courier::Storage::builder()
///     .namespace("staging")
///     .from_env()?
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StorageBuilder {
    namespace: Option<String>,
    redis_url: Option<String>,
    max_size: Option<usize>,
    timeouts: StorageBuilderTimeouts,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefixes every key with `courier:<namespace>`, isolating this storage from
    /// others sharing the same Redis.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn url(mut self, redis_url: impl Into<String>) -> Self {
        self.redis_url = Some(redis_url.into());
        self
    }

    /// Reads the Redis URL from `REDIS_URL`.
    pub fn from_env(self) -> Result<Self, CourierError> {
        let redis_url =
            std::env::var("REDIS_URL").map_err(|_| CourierError::ConfigRedisNotConfigured)?;
        Ok(self.url(redis_url))
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn timeouts(mut self, timeouts: StorageBuilderTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> Result<Storage, CourierError> {
        let redis_url = self
            .redis_url
            .clone()
            .ok_or(CourierError::ConfigRedisNotConfigured)?;

        let mut cfg = deadpool_redis::Config::from_url(redis_url);
        let mut pool_config = deadpool_redis::PoolConfig::default();
        if let Some(max_size) = self.max_size {
            pool_config.max_size = max_size;
        }
        pool_config.timeouts = deadpool_redis::Timeouts {
            wait: self.timeouts.wait,
            create: self.timeouts.create,
            recycle: self.timeouts.recycle,
        };
        cfg.pool = Some(pool_config);

        let pool = cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        self.build_from_pool(pool)
    }

    pub fn build_from_env(self) -> Result<Storage, CourierError> {
        self.from_env()?.build()
    }

    pub fn build_from_pool(self, pool: deadpool_redis::Pool) -> Result<Storage, CourierError> {
        let backend = RedisBackend::new(pool, self.namespace);
        Ok(Storage::from_backend(Arc::new(backend)))
    }

    /// Storage that lives in this process only. Nothing survives a restart and
    /// nothing is shared with other processes.
    pub fn build_in_memory(self) -> Storage {
        Storage::from_backend(Arc::new(MemoryBackend::new()))
    }
}
