use courier::{Context, JobError, RateLimitBucket, RateLimiter, handler_fn};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Clone)]
struct Services {
    completions: RateLimiter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Summarize {
    document_id: u64,
}

courier::job_catalog! {
    #[derive(Debug, Clone)]
    enum AppJob {
        Summarize(Summarize) = "ai.summarize",
    }
}

#[tokio::main]
pub async fn main() -> Result<(), courier::CourierError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let storage = courier::Storage::builder().build_from_env()?;
    let services = Services {
        completions: RateLimiter::new(
            &storage,
            RateLimitBucket::windowed("completions", 2, Duration::from_secs(2)),
        ),
    };

    let handler = handler_fn(|job: AppJob, ctx: &Context<Services>| {
        let limiter = ctx.ctx.completions.clone();
        async move {
            let AppJob::Summarize(job) = job;
            let summary = limiter
                .do_when_available(|| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    format!("summary of {}", job.document_id)
                })
                .await?;
            tracing::info!(summary, "Summarized");
            Ok::<(), JobError>(())
        }
    });

    let registry = Arc::new(courier::Registry::<AppJob>::new(&storage));
    let config = courier::Config::new(registry)
        .register_worker_with(
            "ai",
            handler,
            courier::WorkerOptions::default().concurrency(4),
        )
        .exit_when_processed(8);
    let producer = config.producer();

    for document_id in 0..8 {
        producer
            .enqueue_job(
                &AppJob::Summarize(Summarize { document_id }),
                courier::EnqueueOptions::default(),
            )
            .await;
    }

    courier::run(config, services).await?;

    Ok(())
}
