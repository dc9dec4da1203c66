use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    Config, CourierError, JobKind, Storage,
    backend::RetentionPolicy,
    repeating::repeating_loop,
    stats::RunStats,
    worker::{RunState, run_worker},
};

/// Runs the registered workers and the maintenance loops until the shutdown
/// signal fires, the config's cancel token is cancelled, or
/// [`exit_when_processed`](Config::exit_when_processed) is reached.
///
/// In-flight jobs get [`shutdown_timeout`](Config::shutdown_timeout) to finish;
/// whatever is still running after that is aborted and will be reclaimed once
/// its lease expires.
pub async fn run<J, C>(mut config: Config<J, C>, ctx: C) -> Result<RunStats, CourierError>
where
    J: JobKind,
    C: Clone + Send + Sync + 'static,
{
    let shutdown_signal = config.consume_shutdown_signal();
    let cancel_token = config.cancel_token.clone();
    let storage = config.registry.storage().clone();
    let catalog_queues = config.registry.queue_names();

    tracing::info!(
        namespace = storage.namespace(),
        hostname = %gethostname::gethostname().to_string_lossy(),
        pid = std::process::id(),
        queues = ?config.workers.iter().map(|worker| worker.queue.as_str()).collect::<Vec<_>>(),
        "Starting courier"
    );

    for worker in &config.workers {
        if !catalog_queues.contains(&worker.queue.as_str()) {
            tracing::warn!(queue = worker.queue, "No job in the catalog routes to this queue");
        }
    }

    let state = Arc::new(RunState {
        storage: storage.clone(),
        ctx,
        reporter: Arc::clone(&config.reporter),
        stats: Mutex::new(RunStats::default()),
        exit_when_processed: config.exit_when_processed,
        cancel_token: cancel_token.clone(),
    });

    let mut workers = JoinSet::new();
    for worker in &config.workers {
        for _ in 0..worker.options.concurrency.max(1) {
            workers.spawn(run_worker(Arc::clone(&state), Arc::clone(worker)));
        }
    }

    let mut maintenance = JoinSet::new();
    maintenance.spawn(reclaim_loop(
        storage.clone(),
        config.reclaim_interval,
        cancel_token.clone(),
    ));
    maintenance.spawn(cleanup_loop(
        storage.clone(),
        config.retention,
        config.cleanup_interval,
        cancel_token.clone(),
    ));
    maintenance.spawn(repeating_loop(
        config.producer(),
        catalog_queues.iter().map(|queue| queue.to_string()).collect(),
        config.repeating_interval,
        cancel_token.clone(),
    ));

    let mut result = Ok(());
    tokio::select! {
        signal = shutdown_signal => {
            tracing::info!("Received shutdown signal");
            if let Err(e) = signal {
                result = Err(CourierError::SignalError(e));
            }
        }
        _ = cancel_token.cancelled() => {}
    }

    cancel_token.cancel();
    tracing::info!("Shutting down, waiting for in-flight jobs");

    let drain = async {
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Err(e)) => tracing::error!("Worker loop failed: {}", e),
                Err(e) => tracing::error!("Worker task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain)
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timeout reached, aborting in-flight jobs");
        workers.abort_all();
    }

    while let Some(joined) = maintenance.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::error!("Maintenance loop failed: {}", e);
        }
    }

    let stats = *state.stats.lock();
    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead = stats.dead,
        abandoned = stats.abandoned,
        "Courier stopped"
    );

    result.map(|()| stats)
}

async fn reclaim_loop(
    storage: Storage,
    interval: Duration,
    cancel_token: CancellationToken,
) -> Result<(), CourierError> {
    tracing::info!("Starting reclaim loop");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = storage.reclaim_expired().await {
                    tracing::warn!("Failed to reclaim expired leases: {}", e);
                }
            }
        }
    }
}

async fn cleanup_loop(
    storage: Storage,
    retention: RetentionPolicy,
    interval: Duration,
    cancel_token: CancellationToken,
) -> Result<(), CourierError> {
    tracing::info!("Starting cleanup loop");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = storage.prune(&retention).await {
                    tracing::warn!("Failed to prune finished jobs: {}", e);
                }
            }
        }
    }
}
