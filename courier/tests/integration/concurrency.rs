use crate::shared::*;
use courier::{CollectingReporter, CourierError, EnqueueOptions, Storage};
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Duration};
use testresult::TestResult;

async fn drain(storage: Storage) -> Result<Vec<String>, CourierError> {
    let mut claimed = vec![];
    while let Some(envelope) = storage.claim_next("slack", Duration::from_secs(30)).await? {
        claimed.push(envelope.id.clone());
        storage.ack(envelope).await?;
        tokio::task::yield_now().await;
    }
    Ok(claimed)
}

#[tokio::test]
pub async fn test_concurrent_claimers_never_share_a_job() -> TestResult {
    let (storage, registry) = memory();
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let mut enqueued = HashSet::new();
    for i in 0..50 {
        let job_id = producer
            .enqueue(
                "slack.post",
                json!({"channel": "#ops", "text": format!("message {i}")}),
                EnqueueOptions::default(),
            )
            .await
            .ok_or("job was not enqueued")?;
        enqueued.insert(job_id);
    }

    let mut claimers = tokio::task::JoinSet::new();
    for _ in 0..4 {
        claimers.spawn(drain(storage.clone()));
    }

    let mut claimed = vec![];
    while let Some(joined) = claimers.join_next().await {
        claimed.extend(joined??);
    }

    let unique: HashSet<String> = claimed.iter().cloned().collect();
    assert_eq!(claimed.len(), 50);
    assert_eq!(unique, enqueued);
    assert_eq!(storage.completed_count().await?, 50);

    Ok(())
}

#[tokio::test]
pub async fn test_expired_lease_is_claimable_again() -> TestResult {
    let (storage, registry) = memory();
    let producer = producer(&registry, Arc::new(CollectingReporter::new()));

    let job_id = producer
        .enqueue("slack.post", json!({"channel": "#ops", "text": "x"}), EnqueueOptions::default())
        .await
        .ok_or("job was not enqueued")?;

    // a worker that dies holding the lease
    let abandoned = storage
        .claim_next("slack", Duration::from_millis(50))
        .await?
        .ok_or("nothing to claim")?;
    assert_eq!(abandoned.id, job_id);
    assert!(storage.claim_next("slack", Duration::from_secs(30)).await?.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(storage.reclaim_expired().await?, 1);

    let reclaimed = storage
        .claim_next("slack", Duration::from_secs(30))
        .await?
        .ok_or("reclaimed job was not claimable")?;
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.meta.attempts, 0);

    // the first worker wakes up and tries to finish
    assert!(!storage.extend_lease(&abandoned, Duration::from_secs(30)).await?);
    let late_ack = storage.ack(abandoned).await;
    assert!(matches!(late_ack, Err(CourierError::LeaseLost(_))));
    assert_eq!(storage.completed_count().await?, 0);

    storage.ack(reclaimed).await?;
    assert_eq!(storage.completed_count().await?, 1);
    assert_eq!(storage.enqueued_count("slack").await?.active, 0);

    Ok(())
}
