use std::{pin::Pin, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    JobKind, Producer, Registry,
    backend::RetentionPolicy,
    handler::Handler,
    reporter::{Reporter, TracingReporter},
    worker::{QueueWorker, WorkerOptions},
};

type ShutdownSignal = Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send + Sync>>;

/// Everything [`run`](crate::run) needs: the registry, one handler per queue and
/// the maintenance settings.
pub struct Config<J: JobKind, C> {
    pub(crate) registry: Arc<Registry<J>>,
    pub(crate) workers: Vec<Arc<QueueWorker<J, C>>>,
    pub(crate) retention: RetentionPolicy,
    pub(crate) exit_when_processed: Option<u64>,
    pub(crate) shutdown_signal: ShutdownSignal,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) reporter: Arc<dyn Reporter>,
    pub(crate) reclaim_interval: Duration,
    pub(crate) cleanup_interval: Duration,
    pub(crate) repeating_interval: Duration,
}

impl<J: JobKind, C> Config<J, C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<Registry<J>>) -> Self {
        Self {
            registry,
            workers: vec![],
            retention: RetentionPolicy::default(),
            exit_when_processed: None,
            shutdown_signal: Box::pin(default_shutdown_signal()),
            shutdown_timeout: Duration::from_secs(180),
            cancel_token: CancellationToken::new(),
            reporter: Arc::new(TracingReporter),
            reclaim_interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(600),
            repeating_interval: Duration::from_secs(1),
        }
    }

    /// Processes the jobs of `queue` with `handler`, using default [`WorkerOptions`].
    pub fn register_worker(self, queue: impl Into<String>, handler: impl Handler<J, C>) -> Self {
        self.register_worker_with(queue, handler, WorkerOptions::default())
    }

    /// Like [`register_worker`](Config::register_worker). Registering a queue twice
    /// replaces the earlier handler.
    pub fn register_worker_with(
        mut self,
        queue: impl Into<String>,
        handler: impl Handler<J, C>,
        options: WorkerOptions,
    ) -> Self {
        let queue = queue.into();
        self.workers.retain(|worker| worker.queue != queue);
        self.workers.push(Arc::new(QueueWorker {
            queue,
            handler: Arc::new(handler),
            options,
        }));
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Stops the run once this many attempts have been processed.
    pub fn exit_when_processed(mut self, processed: u64) -> Self {
        self.exit_when_processed = Some(processed);
        self
    }

    pub fn with_graceful_shutdown(
        mut self,
        fut: impl Future<Output = Result<(), std::io::Error>> + Send + Sync + 'static,
    ) -> Self {
        self.shutdown_signal = Box::pin(fut);
        self
    }

    /// How long in-flight jobs may keep running after shutdown starts.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// How often expired leases are returned to their queue.
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn repeating_interval(mut self, interval: Duration) -> Self {
        self.repeating_interval = interval;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// A producer sharing this config's registry and reporter.
    pub fn producer(&self) -> Producer<J> {
        Producer::new(Arc::clone(&self.registry)).with_reporter(Arc::clone(&self.reporter))
    }

    pub fn has_registered_worker(&self, queue: &str) -> bool {
        self.workers.iter().any(|worker| worker.queue == queue)
    }

    pub(crate) fn consume_shutdown_signal(&mut self) -> ShutdownSignal {
        let mut shutdown_signal: ShutdownSignal = Box::pin(std::future::pending());
        std::mem::swap(&mut self.shutdown_signal, &mut shutdown_signal);
        shutdown_signal
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn default_shutdown_signal() -> Result<(), std::io::Error> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = ctrl_c => Ok(()),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(target_os = "windows")]
async fn default_shutdown_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}
