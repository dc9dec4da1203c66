//! Same flows against a real Redis. Skipped when `REDIS_URL` is not set.

use crate::shared::*;
use courier::{CollectingReporter, EnqueueOptions, RateLimitBucket, RateLimiter, RepeatingJobSpec};
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Duration};
use testresult::TestResult;

#[tokio::test]
pub async fn test_redis_run_to_completion() -> TestResult {
    let Some((storage, registry)) = redis() else {
        return Ok(());
    };
    let config = config(&registry)
        .register_worker_with("notification", noop(), fast_worker().concurrency(3))
        .exit_when_processed(6);
    let producer = config.producer();

    for i in 0..6 {
        producer
            .enqueue(
                "notification.email.send",
                email(&format!("user{i}@example.com")),
                EnqueueOptions::default(),
            )
            .await
            .ok_or("job was not enqueued")?;
    }
    assert_eq!(storage.stats().await?.global.waiting, 6);

    let stats = courier::run(config, ()).await?;

    assert_eq!(stats.succeeded, 6);
    assert_eq!(storage.completed_count().await?, 6);
    assert_eq!(storage.stats().await?.global.waiting, 0);

    Ok(())
}

#[tokio::test]
pub async fn test_redis_claims_are_exclusive_across_pools() -> TestResult {
    let Some((storage, registry)) = redis() else {
        return Ok(());
    };
    let other = courier::Storage::builder()
        .namespace(storage.namespace().trim_start_matches("courier:"))
        .build_from_env()?;
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    for i in 0..20 {
        producer
            .enqueue(
                "slack.post",
                json!({"channel": "#ops", "text": format!("message {i}")}),
                EnqueueOptions::default(),
            )
            .await
            .ok_or("job was not enqueued")?;
    }

    let lease = Duration::from_secs(30);
    let mut claimed = vec![];
    loop {
        let (a, b) = tokio::join!(storage.claim_next("slack", lease), other.claim_next("slack", lease));
        let (a, b) = (a?, b?);
        if a.is_none() && b.is_none() {
            break;
        }
        claimed.extend(a.into_iter().chain(b).map(|envelope| envelope.id));
    }

    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), 20);
    assert_eq!(unique.len(), 20);

    Ok(())
}

#[tokio::test]
pub async fn test_redis_delayed_and_cancel() -> TestResult {
    let Some((storage, registry)) = redis() else {
        return Ok(());
    };
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let job_id = producer
        .enqueue(
            "slack.post",
            json!({"channel": "#ops", "text": "later"}),
            EnqueueOptions::default().delay(Duration::from_secs(60)),
        )
        .await
        .ok_or("job was not enqueued")?;

    assert_eq!(storage.enqueued_count("slack").await?.delayed, 1);
    assert!(storage.claim_next("slack", Duration::from_secs(30)).await?.is_none());
    assert!(storage.cancel(&job_id).await?);
    assert_eq!(storage.enqueued_count("slack").await?.delayed, 0);

    Ok(())
}

#[tokio::test]
pub async fn test_redis_shared_rate_limit() -> TestResult {
    let Some((storage, _)) = redis() else {
        return Ok(());
    };
    let bucket = RateLimitBucket::concurrency(random_string(), 1);
    let first = RateLimiter::new(&storage, bucket.clone());
    let second = RateLimiter::new(&storage, bucket);

    let permit = first.try_acquire().await?.ok_or("bucket has capacity")?;
    assert!(second.try_acquire().await?.is_none());
    permit.release().await?;
    assert!(second.try_acquire().await?.is_some());

    Ok(())
}

#[tokio::test]
pub async fn test_redis_repeating_specs() -> TestResult {
    let Some((storage, registry)) = redis() else {
        return Ok(());
    };
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let spec = RepeatingJobSpec::new(
        "slack.post",
        json!({"channel": "#ops", "text": "standup"}),
        "0 30 9 * * Mon-Fri",
    )?
    .in_timezone("Europe/Warsaw")?;
    producer.schedule_repeating(&spec).await?;
    producer.schedule_repeating(&spec).await?;

    let scheduled = storage.list_scheduled_jobs("slack").await?;
    assert_eq!(scheduled, vec![spec.clone()]);

    assert!(storage.remove_scheduled_job("slack", &spec.id).await?);
    assert!(storage.list_scheduled_jobs("slack").await?.is_empty());

    Ok(())
}
