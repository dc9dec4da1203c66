use courier::{Context, JobError, RepeatingJobSpec, handler_fn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestBuild {
    team: String,
}

courier::job_catalog! {
    #[derive(Debug, Clone)]
    enum AppJob {
        DigestBuild(DigestBuild) = "reports.digest.build",
    }
}

#[tokio::main]
pub async fn main() -> Result<(), courier::CourierError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let storage = courier::Storage::builder().build_from_env()?;
    let registry = Arc::new(courier::Registry::<AppJob>::new(&storage));

    let handler = handler_fn(|job: AppJob, ctx: &Context<()>| {
        let attempt = ctx.attempt();
        async move {
            let AppJob::DigestBuild(digest) = job;
            tracing::info!(team = digest.team, attempt, "Building digest");
            Ok::<(), JobError>(())
        }
    });

    let config = courier::Config::new(registry)
        .register_worker("reports", handler)
        .with_graceful_shutdown(tokio::signal::ctrl_c());

    let spec = RepeatingJobSpec::new(
        "reports.digest.build",
        serde_json::json!({"team": "platform"}),
        "*/5 * * * * *",
    )?
    .in_timezone("Europe/Warsaw")?;
    config.producer().schedule_repeating(&spec).await?;

    courier::run(config, ()).await?;

    Ok(())
}
