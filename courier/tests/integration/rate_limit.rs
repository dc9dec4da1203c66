use crate::shared::*;
use courier::{RateLimitBucket, RateLimiter};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use testresult::TestResult;

#[tokio::test]
pub async fn test_concurrency_limit_holds_third_caller() -> TestResult {
    let (storage, _) = memory();
    let limiter = RateLimiter::new(&storage, RateLimitBucket::concurrency("openai", 2));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut callers = tokio::task::JoinSet::new();
    for i in 0..3 {
        let limiter = limiter.clone();
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        callers.spawn(async move {
            limiter
                .do_when_available(|| async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i
                })
                .await
        });
    }

    let mut finished = vec![];
    while let Some(joined) = callers.join_next().await {
        finished.push(joined??);
    }
    finished.sort_unstable();

    assert_eq!(finished, vec![0, 1, 2]);
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    Ok(())
}

#[tokio::test]
pub async fn test_window_limit_delays_third_call() -> TestResult {
    let (storage, _) = memory();
    let limiter = RateLimiter::new(
        &storage,
        RateLimitBucket::windowed("scraper", 2, Duration::from_millis(200)),
    );

    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        limiter.do_when_available(|| async { Instant::now() }),
        limiter.do_when_available(|| async { Instant::now() }),
        limiter.do_when_available(|| async { Instant::now() }),
    );
    let mut times = vec![a? - start, b? - start, c? - start];
    times.sort_unstable();

    assert!(times[1] < Duration::from_millis(150));
    assert!(times[2] >= Duration::from_millis(150));

    Ok(())
}

#[tokio::test]
pub async fn test_buckets_are_independent() -> TestResult {
    let (storage, _) = memory();
    let openai = RateLimiter::new(&storage, RateLimitBucket::concurrency("openai", 1));
    let scraper = RateLimiter::new(&storage, RateLimitBucket::concurrency("scraper", 1));

    let held = openai.try_acquire().await?.ok_or("openai has capacity")?;
    assert!(openai.try_acquire().await?.is_none());
    assert!(scraper.try_acquire().await?.is_some());

    held.release().await?;
    assert!(openai.try_acquire().await?.is_some());

    Ok(())
}
