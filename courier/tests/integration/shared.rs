use courier::{
    Config, Context, JobError, Producer, Registry, Reporter, Storage, WorkerOptions, handler_fn,
};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSend {
    pub to: String,
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackPost {
    pub channel: String,
    pub text: String,
}

courier::job_catalog! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum AppJob {
        EmailSend(EmailSend) = "notification.email.send",
        SlackPost(SlackPost) = "slack.post",
    }
}

pub fn setup() {
    dotenvy::from_filename(".env.test").ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// In-memory storage plus a registry over it.
pub fn memory() -> (Storage, Arc<Registry<AppJob>>) {
    setup();
    let storage = Storage::builder().build_in_memory();
    let registry = Arc::new(Registry::new(&storage));
    (storage, registry)
}

/// Redis storage in a fresh namespace, or `None` when `REDIS_URL` is not set.
pub fn redis() -> Option<(Storage, Arc<Registry<AppJob>>)> {
    setup();
    let storage = Storage::builder()
        .namespace(random_string())
        .build_from_env()
        .ok()?;
    let registry = Arc::new(Registry::new(&storage));
    Some((storage, registry))
}

pub fn producer(registry: &Arc<Registry<AppJob>>, reporter: Arc<dyn Reporter>) -> Producer<AppJob> {
    Producer::new(Arc::clone(registry)).with_reporter(reporter)
}

pub fn email(to: &str) -> serde_json::Value {
    serde_json::json!({
        "to": to,
        "name": "welcome",
        "data": {"firstName": "Ada"},
    })
}

/// Worker options tuned for tests: quick polling, short store backoff.
pub fn fast_worker() -> WorkerOptions {
    WorkerOptions::default()
        .poll_interval(Duration::from_millis(10))
        .store_backoff(Duration::from_millis(50))
}

pub fn config(registry: &Arc<Registry<AppJob>>) -> Config<AppJob, ()> {
    Config::new(Arc::clone(registry))
        .with_graceful_shutdown(std::future::pending())
        .shutdown_timeout(Duration::from_secs(5))
}

pub fn noop() -> impl courier::Handler<AppJob, ()> {
    handler_fn(|_job: AppJob, _ctx: &Context<()>| async { Ok::<(), JobError>(()) })
}

pub fn random_string() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 16)
}
