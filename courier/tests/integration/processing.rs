use crate::shared::*;
use courier::{
    Backoff, CollectingReporter, Context, EnqueueOptions, FailureReportKind, JobError, RunStats,
    handler_fn,
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use testresult::TestResult;

#[tokio::test]
pub async fn test_jobs_are_processed_and_completed() -> TestResult {
    let (storage, registry) = memory();
    let config = config(&registry)
        .register_worker_with("notification", noop(), fast_worker().concurrency(2))
        .exit_when_processed(5);
    let producer = config.producer();

    for i in 0..5 {
        producer
            .enqueue(
                "notification.email.send",
                email(&format!("user{i}@example.com")),
                EnqueueOptions::default(),
            )
            .await
            .ok_or("job was not enqueued")?;
    }

    let stats = courier::run(config, ()).await?;

    assert_eq!(
        stats,
        RunStats {
            processed: 5,
            succeeded: 5,
            retried: 0,
            dead: 0,
            abandoned: 0,
        }
    );
    assert_eq!(storage.completed_count().await?, 5);
    assert_eq!(storage.enqueued_count("notification").await?.waiting, 0);

    Ok(())
}

#[tokio::test]
pub async fn test_failing_job_is_attempted_three_times_then_dead() -> TestResult {
    let (storage, registry) = memory();
    let reporter = CollectingReporter::new();
    let calls = Arc::new(AtomicU32::new(0));

    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |_job: AppJob, ctx: &Context<()>| {
            let attempt = ctx.attempt();
            let calls = Arc::clone(&calls);
            async move {
                let seen = calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(attempt, seen);
                Err::<(), JobError>(JobError::retryable("smtp unreachable"))
            }
        })
    };

    let config = config(&registry)
        .with_reporter(Arc::new(reporter.clone()))
        .register_worker_with("notification", handler, fast_worker())
        .exit_when_processed(3);
    let producer = config.producer();

    let job_id = producer
        .enqueue(
            "notification.email.send",
            email("ada@example.com"),
            EnqueueOptions::default().backoff(Backoff::fixed(Duration::from_millis(20))),
        )
        .await
        .ok_or("job was not enqueued")?;

    let stats = courier::run(config, ()).await?;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead, 1);

    let dead = storage.list_dead(&Default::default()).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert_eq!(dead[0].meta.attempts, 3);
    assert_eq!(dead[0].meta.last_error.as_deref(), Some("smtp unreachable"));

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureReportKind::Dead);
    assert_eq!(reports[0].job_id.as_deref(), Some(job_id.as_str()));
    assert_eq!(reports[0].attempts, 3);

    Ok(())
}

#[tokio::test]
pub async fn test_fatal_error_skips_retries() -> TestResult {
    let (storage, registry) = memory();
    let handler = handler_fn(|job: AppJob, _ctx: &Context<()>| async move {
        match job {
            AppJob::SlackPost(post) if post.channel.is_empty() => {
                Err(JobError::fatal("channel is required"))
            }
            _ => Ok(()),
        }
    });

    let config = config(&registry)
        .register_worker_with("slack", handler, fast_worker())
        .exit_when_processed(2);
    let producer = config.producer();

    producer
        .enqueue("slack.post", json!({"channel": "", "text": "x"}), EnqueueOptions::default())
        .await
        .ok_or("job was not enqueued")?;
    producer
        .enqueue("slack.post", json!({"channel": "#ops", "text": "x"}), EnqueueOptions::default())
        .await
        .ok_or("job was not enqueued")?;

    let stats = courier::run(config, ()).await?;

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(storage.dead_count().await?, 1);
    assert_eq!(storage.completed_count().await?, 1);

    Ok(())
}

#[tokio::test]
pub async fn test_handler_receives_context() -> TestResult {
    #[derive(Clone)]
    struct Mailer {
        sent: Arc<AtomicU32>,
    }

    let (_, registry) = memory();
    let mailer = Mailer {
        sent: Arc::new(AtomicU32::new(0)),
    };

    let handler = handler_fn(|job: AppJob, ctx: &Context<Mailer>| {
        let sent = Arc::clone(&ctx.ctx.sent);
        let queue = ctx.queue.clone();
        async move {
            assert_eq!(queue, "notification");
            if let AppJob::EmailSend(email) = job {
                assert_eq!(email.to, "ada@example.com");
                sent.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<(), JobError>(())
        }
    });

    let config = courier::Config::<AppJob, Mailer>::new(Arc::clone(&registry))
        .with_graceful_shutdown(std::future::pending())
        .register_worker_with("notification", handler, fast_worker())
        .exit_when_processed(1);
    config
        .producer()
        .enqueue("notification.email.send", email("ada@example.com"), EnqueueOptions::default())
        .await
        .ok_or("job was not enqueued")?;

    courier::run(config, mailer.clone()).await?;

    assert_eq!(mailer.sent.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
pub async fn test_cancel_token_stops_idle_run() -> TestResult {
    let (_, registry) = memory();
    let config = config(&registry).register_worker_with("notification", noop(), fast_worker());
    let cancel_token = config.cancel_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();
    });

    let stats = tokio::time::timeout(Duration::from_secs(5), courier::run(config, ())).await??;
    assert_eq!(stats, RunStats::default());

    Ok(())
}

#[tokio::test]
pub async fn test_shutdown_signal_stops_run() -> TestResult {
    let (_, registry) = memory();
    let config = courier::Config::<AppJob, ()>::new(Arc::clone(&registry))
        .with_graceful_shutdown(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .register_worker_with("notification", noop(), fast_worker());

    let stats = tokio::time::timeout(Duration::from_secs(5), courier::run(config, ())).await??;
    assert_eq!(stats.processed, 0);

    Ok(())
}
