use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSend {
    pub to: String,
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Noop {}

crate::job_catalog! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum TestJob {
        EmailSend(EmailSend) = "notification.email.send",
        Noop(Noop) = "test.noop",
    }
}

pub fn random_string() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 16)
}

/// Pool for the Redis backend tests, or `None` when `REDIS_URL` is not set.
pub fn redis_pool() -> Option<deadpool_redis::Pool> {
    dotenvy::from_filename(".env.test").ok();
    let redis_url = std::env::var("REDIS_URL").ok()?;
    deadpool_redis::Config::from_url(redis_url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .ok()
}
