use crate::shared::*;
use courier::{
    Backoff, CollectingReporter, EnqueueOptions, FailureReportKind, JobKind, JobState,
    QueueCounts, Registry, Storage,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use testresult::TestResult;

#[tokio::test]
pub async fn test_enqueue_then_claim() -> TestResult {
    let (storage, registry) = memory();
    let reporter = CollectingReporter::new();
    let producer = producer(&registry, Arc::new(reporter.clone()));

    let job_id = producer
        .enqueue("notification.email.send", email("ada@example.com"), EnqueueOptions::default())
        .await
        .ok_or("job was not enqueued")?;

    let envelope = storage
        .claim_next("notification", Duration::from_secs(30))
        .await?
        .ok_or("nothing to claim")?;

    assert_eq!(envelope.id, job_id);
    assert_eq!(envelope.name, "notification.email.send");
    assert_eq!(envelope.payload, email("ada@example.com"));
    assert_eq!(envelope.meta.state, JobState::Active);
    assert_eq!(envelope.meta.attempts, 0);
    assert_eq!(envelope.meta.max_attempts, 3);
    assert_eq!(envelope.meta.backoff, Backoff::exponential(Duration::from_secs(5)));
    assert!(reporter.is_empty());

    let job = AppJob::decode(&envelope.name, envelope.payload)?;
    assert_eq!(job.queue_name(), "notification");

    Ok(())
}

#[tokio::test]
pub async fn test_invalid_payload_is_reported_once() -> TestResult {
    let (storage, registry) = memory();
    let reporter = CollectingReporter::new();
    let producer = producer(&registry, Arc::new(reporter.clone()));

    let job_id = producer
        .enqueue(
            "notification.email.send",
            json!({"name": "welcome", "data": {}}),
            EnqueueOptions::default(),
        )
        .await;

    assert!(job_id.is_none());
    assert_eq!(storage.enqueued_count("notification").await?, QueueCounts::default());

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureReportKind::Validation);
    assert_eq!(reports[0].job_name, "notification.email.send");
    assert!(reports[0].job_id.is_none());
    assert!(reports[0].error.contains("to"));

    Ok(())
}

#[tokio::test]
pub async fn test_unknown_job_name_is_reported() -> TestResult {
    let (storage, registry) = memory();
    let reporter = CollectingReporter::new();
    let producer = producer(&registry, Arc::new(reporter.clone()));

    let job_id = producer
        .enqueue("notification.sms.send", json!({}), EnqueueOptions::default())
        .await;

    assert!(job_id.is_none());
    assert!(storage.list_queue_names().await?.is_empty());
    assert_eq!(reporter.len(), 1);

    Ok(())
}

#[tokio::test]
pub async fn test_delayed_job_waits_and_can_be_cancelled() -> TestResult {
    let (storage, registry) = memory();
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let delayed = producer
        .enqueue(
            "slack.post",
            json!({"channel": "#ops", "text": "later"}),
            EnqueueOptions::default().delay(Duration::from_secs(60)),
        )
        .await
        .ok_or("job was not enqueued")?;
    let soon = producer
        .enqueue(
            "slack.post",
            json!({"channel": "#ops", "text": "soon"}),
            EnqueueOptions::default().delay(Duration::from_millis(50)),
        )
        .await
        .ok_or("job was not enqueued")?;

    assert_eq!(storage.enqueued_count("slack").await?.delayed, 2);
    assert!(storage.claim_next("slack", Duration::from_secs(30)).await?.is_none());

    assert!(storage.cancel(&delayed).await?);
    assert!(!storage.cancel(&delayed).await?);
    assert!(storage.get_job(&delayed).await?.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let claimed = storage
        .claim_next("slack", Duration::from_secs(30))
        .await?
        .ok_or("due job was not claimable")?;
    assert_eq!(claimed.id, soon);
    assert!(!storage.cancel(&soon).await?);

    Ok(())
}

#[tokio::test]
pub async fn test_producer_defaults_apply() -> TestResult {
    let (storage, _) = memory();
    let registry = Arc::new(
        courier::Registry::<AppJob>::new(&storage).with_defaults(courier::JobDefaults {
            max_attempts: 5,
            backoff: Backoff::fixed(Duration::from_secs(1)),
        }),
    );
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let job_id = producer
        .enqueue(
            "slack.post",
            json!({"channel": "#ops", "text": "hi"}),
            EnqueueOptions::default(),
        )
        .await
        .ok_or("job was not enqueued")?;
    let overridden = producer
        .enqueue(
            "slack.post",
            json!({"channel": "#ops", "text": "hi"}),
            EnqueueOptions::default().max_attempts(1),
        )
        .await
        .ok_or("job was not enqueued")?;

    let job = storage.get_job(&job_id).await?.ok_or("job is missing")?;
    assert_eq!(job.meta.max_attempts, 5);
    assert_eq!(job.meta.backoff, Backoff::fixed(Duration::from_secs(1)));

    let job = storage.get_job(&overridden).await?.ok_or("job is missing")?;
    assert_eq!(job.meta.max_attempts, 1);

    Ok(())
}

#[tokio::test]
pub async fn test_unreachable_store_is_reported_not_raised() -> TestResult {
    setup();
    // nothing listens on port 1
    let storage = Storage::builder().url("redis://127.0.0.1:1").build()?;
    let registry = Arc::new(Registry::<AppJob>::new(&storage));
    let reporter = CollectingReporter::new();
    let producer = producer(&registry, Arc::new(reporter.clone()));

    let job_id = producer
        .enqueue("notification.email.send", email("ada@example.com"), EnqueueOptions::default())
        .await;

    assert!(job_id.is_none());
    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureReportKind::Enqueue);
    assert_eq!(reports[0].job_name, "notification.email.send");
    assert_eq!(reports[0].queue, "notification");
    assert_eq!(reports[0].job_id, None);

    let err = producer
        .try_enqueue("notification.email.send", email("ada@example.com"), EnqueueOptions::default())
        .await
        .err()
        .ok_or("enqueue into an unreachable store succeeded")?;
    assert!(err.is_store_unavailable());
    assert_eq!(reporter.len(), 1);

    Ok(())
}
