//! Shared rate limits for calls to metered external services.
//!
//! The counters live in the store, so every process calling the same service
//! through the same bucket key shares one limit.

use chrono::Utc;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{CourierError, Storage};

const DEFAULT_SLOT_TTL: Duration = Duration::from_secs(300);
const MIN_POLL: Duration = Duration::from_millis(25);
const MAX_POLL: Duration = Duration::from_secs(1);

/// One shared limit.
///
/// With a `window`, at most `limit` acquisitions happen per window. Without
/// one, at most `limit` permits are held at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub key: String,
    pub limit: u64,
    pub window: Option<Duration>,
}

impl RateLimitBucket {
    pub fn windowed(key: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            key: key.into(),
            limit,
            window: Some(window),
        }
    }

    pub fn concurrency(key: impl Into<String>, limit: u64) -> Self {
        Self {
            key: key.into(),
            limit,
            window: None,
        }
    }
}

/// Suspends callers until their [`RateLimitBucket`] has capacity.
///
/// ```rust
/// # async fn example(storage: courier::Storage) -> Result<(), courier::CourierError> {
/// use courier::{RateLimitBucket, RateLimiter};
/// use std::time::Duration;
///
/// let openai = RateLimiter::new(
///     &storage,
///     RateLimitBucket::windowed("openai", 60, Duration::from_secs(60)),
/// );
/// let answer = openai.do_when_available(|| async { "completion" }).await?;
/// # let _ = answer;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    storage: Storage,
    bucket: RateLimitBucket,
    slot_ttl: Duration,
}

impl RateLimiter {
    pub fn new(storage: &Storage, bucket: RateLimitBucket) -> Self {
        Self {
            storage: storage.clone(),
            bucket,
            slot_ttl: DEFAULT_SLOT_TTL,
        }
    }

    /// How long a concurrency slot outlives the last refresh of its permit. A held
    /// permit refreshes every third of this, so it only bounds how long a process
    /// that died while holding one keeps its slot.
    pub fn slot_ttl(mut self, ttl: Duration) -> Self {
        self.slot_ttl = ttl;
        self
    }

    pub fn bucket(&self) -> &RateLimitBucket {
        &self.bucket
    }

    /// Takes capacity if there is some right now.
    pub async fn try_acquire(&self) -> Result<Option<Permit>, CourierError> {
        Ok(self.attempt().await?.ok())
    }

    /// Waits until the bucket has capacity and takes it.
    ///
    /// The returned [`Permit`] must be held for as long as the guarded work runs.
    /// Windowed permits hold nothing; concurrency permits free their slot when
    /// released or dropped.
    pub async fn process(&self) -> Result<Permit, CourierError> {
        let mut poll = MIN_POLL;
        loop {
            match self.attempt().await? {
                Ok(permit) => return Ok(permit),
                Err(Some(reset_in)) => {
                    tracing::debug!(
                        bucket = self.bucket.key,
                        wait_ms = reset_in.as_millis() as u64,
                        "Rate limit window saturated"
                    );
                    tokio::time::sleep(reset_in.max(MIN_POLL)).await;
                }
                Err(None) => {
                    tracing::trace!(bucket = self.bucket.key, "No free slot");
                    tokio::time::sleep(poll).await;
                    poll = (poll * 2).min(MAX_POLL);
                }
            }
        }
    }

    /// Runs `f` once capacity is available, holding the permit until it finishes.
    pub async fn do_when_available<F, Fut, T>(&self, f: F) -> Result<T, CourierError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.process().await?;
        let output = f().await;
        permit.release().await?;
        Ok(output)
    }

    /// `Err(Some(wait))` when a window is saturated, `Err(None)` when all slots
    /// are taken.
    async fn attempt(&self) -> Result<Result<Permit, Option<Duration>>, CourierError> {
        let backend = self.storage.backend();
        let now = Utc::now();

        match self.bucket.window {
            Some(window) => {
                let acquired = backend
                    .window_acquire(&self.bucket.key, self.bucket.limit, window, now)
                    .await?;
                if acquired.granted {
                    Ok(Ok(Permit { slot: None }))
                } else {
                    Ok(Err(Some(acquired.reset_in)))
                }
            }
            None => {
                let token = Uuid::new_v4().to_string();
                let acquired = backend
                    .slot_acquire(&self.bucket.key, self.bucket.limit, &token, self.slot_ttl, now)
                    .await?;
                if acquired {
                    let refresh = self.keep_alive(token.clone());
                    Ok(Ok(Permit {
                        slot: Some(Slot {
                            storage: self.storage.clone(),
                            key: self.bucket.key.clone(),
                            token,
                            refresh,
                        }),
                    }))
                } else {
                    Ok(Err(None))
                }
            }
        }
    }

    /// Refreshes the slot held by `token` until the returned token is cancelled.
    fn keep_alive(&self, token: String) -> CancellationToken {
        let cancel_token = CancellationToken::new();
        let stopped = cancel_token.clone();
        let storage = self.storage.clone();
        let bucket = self.bucket.clone();
        let ttl = self.slot_ttl;

        tokio::spawn(async move {
            let mut refresh = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
            refresh.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => return,
                    _ = refresh.tick() => {
                        let renewed = storage
                            .backend()
                            .slot_acquire(&bucket.key, bucket.limit, &token, ttl, Utc::now())
                            .await;
                        match renewed {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::warn!(bucket = bucket.key, "Slot expired while held");
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(bucket = bucket.key, "Failed to refresh slot: {}", e);
                            }
                        }
                    }
                }
            }
        });

        cancel_token
    }
}

struct Slot {
    storage: Storage,
    key: String,
    token: String,
    refresh: CancellationToken,
}

/// Capacity taken from a [`RateLimiter`].
///
/// Dropping a concurrency permit without calling [`release`](Permit::release)
/// still frees its slot, from a background task.
#[must_use = "capacity is given back as soon as the permit is dropped"]
pub struct Permit {
    slot: Option<Slot>,
}

impl Permit {
    pub async fn release(mut self) -> Result<(), CourierError> {
        match self.slot.take() {
            Some(slot) => {
                slot.refresh.cancel();
                slot.storage.backend().slot_release(&slot.key, &slot.token).await
            }
            None => Ok(()),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        slot.refresh.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = slot.storage.backend().slot_release(&slot.key, &slot.token).await {
                        tracing::warn!(bucket = slot.key, "Failed to release slot: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(bucket = slot.key, "Slot dropped outside a runtime, it expires on its own");
            }
        }
    }
}
