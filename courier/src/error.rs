use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Generic error: {0}")]
    GenericError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("REDIS_URL is not set")]
    ConfigRedisNotConfigured,

    #[error("Invalid job payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job not found")]
    JobNotFound,

    #[error("Lease on job {0} is held by another claim")]
    LeaseLost(String),

    #[error("Invalid cron pattern `{pattern}`: {source}")]
    InvalidCron {
        pattern: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("Invalid timezone `{0}`")]
    InvalidTimezone(String),

    #[error("Redis error: {0}")]
    RedisError(#[from] deadpool_redis::redis::RedisError),

    #[error("Redis pool error: {0}")]
    DeadpoolRedisPoolError(#[from] deadpool_redis::PoolError),

    #[error("Redis pool build error: {0}")]
    DeadpoolRedisCreatePoolError(#[from] deadpool_redis::CreatePoolError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Shutdown signal error: {0}")]
    SignalError(#[from] std::io::Error),
}

impl CourierError {
    /// True when the error means the durable store could not be reached, as
    /// opposed to a problem with the data itself.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            CourierError::DeadpoolRedisPoolError(_) => true,
            CourierError::RedisError(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}
