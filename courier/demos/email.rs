use courier::{Context, EnqueueOptions, JobError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, thiserror::Error)]
enum MailerError {
    #[error("Mailbox {0} rejected the message")]
    Rejected(String),
}

#[derive(Debug, Clone)]
struct Mailer {
    from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailSend {
    to: String,
    name: String,
    data: serde_json::Value,
}

courier::job_catalog! {
    #[derive(Debug, Clone)]
    enum AppJob {
        EmailSend(EmailSend) = "notification.email.send",
    }
}

struct EmailHandler;

#[async_trait::async_trait]
impl courier::Handler<AppJob, Mailer> for EmailHandler {
    async fn handle(&self, job: AppJob, ctx: &Context<Mailer>) -> Result<(), JobError> {
        let AppJob::EmailSend(email) = job;
        if email.to.ends_with("@invalid") {
            return Err(JobError::fatal(MailerError::Rejected(email.to)));
        }
        if ctx.attempt() == 1 && email.to.starts_with("flaky") {
            // transient: retried after the backoff
            return Err(MailerError::Rejected(email.to).into());
        }
        tracing::info!(
            from = ctx.ctx.from,
            to = email.to,
            template = email.name,
            "Email sent"
        );
        Ok(())
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
    let config = courier::Config::new(registry)
        .register_worker("notification", EmailHandler)
        .exit_when_processed(4);
    let producer = config.producer();

    for to in ["ada@example.com", "flaky@example.com", "nobody@invalid"] {
        producer
            .enqueue(
                "notification.email.send",
                serde_json::json!({"to": to, "name": "welcome", "data": {}}),
                EnqueueOptions::default().backoff(courier::Backoff::fixed(
                    std::time::Duration::from_secs(1),
                )),
            )
            .await;
    }

    // rejected by validation, only reported
    producer
        .enqueue(
            "notification.email.send",
            serde_json::json!({"name": "welcome"}),
            EnqueueOptions::default(),
        )
        .await;

    let stats = courier::run(config, Mailer {
        from: "noreply@example.com".to_string(),
    })
    .await?;
    tracing::info!(?stats, "Done");

    Ok(())
}
