use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = String;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub meta: JobMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Delay between attempts. `attempts` is the number of attempts already made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// `base * 2^(attempts - 1)`
    Exponential { base_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(DEFAULT_BACKOFF_BASE)
    }
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base_ms: base.as_millis() as u64,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Exponential { base_ms } => {
                let exponent = attempts.saturating_sub(1).min(32);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
            }
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobMeta {
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Microseconds since the epoch.
    pub created_at: i64,
    /// Microseconds since the epoch; the job is not claimable before this.
    pub available_at: i64,
    #[serde(default)]
    pub lease_expires_at: Option<i64>,
    /// Identifies the claim holding the lease. A new claim gets a new token.
    #[serde(default)]
    pub lease_token: Option<String>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when the job was produced by a repeating schedule.
    #[serde(default)]
    pub repeat_id: Option<String>,
}

/// Per-call overrides for [`Producer::enqueue`](crate::Producer::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl EnqueueOptions {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn delay_ms(self, delay_ms: u64) -> Self {
        self.delay(Duration::from_millis(delay_ms))
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.at = Some(time);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Defaults applied when an [`EnqueueOptions`] field is unset.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl JobEnvelope {
    pub(crate) fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: &EnqueueOptions,
        defaults: &JobDefaults,
        now: DateTime<Utc>,
    ) -> Self {
        let available = match (options.at, options.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => {
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
            }
            (None, None) => now,
        };
        let available = available.max(now);
        let state = if available > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            name: name.into(),
            payload,
            meta: JobMeta {
                state,
                attempts: 0,
                max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts).max(1),
                backoff: options.backoff.unwrap_or(defaults.backoff),
                created_at: now.timestamp_micros(),
                available_at: available.timestamp_micros(),
                lease_expires_at: None,
                lease_token: None,
                finished_at: None,
                last_error: None,
                repeat_id: None,
            },
        }
    }

    pub(crate) fn claimed(mut self, lease_expires_at: DateTime<Utc>, lease_token: String) -> Self {
        self.meta.state = JobState::Active;
        self.meta.lease_expires_at = Some(lease_expires_at.timestamp_micros());
        self.meta.lease_token = Some(lease_token);
        self
    }

    /// Token of the claim this envelope was handed out with, empty when unclaimed.
    pub(crate) fn lease_token(&self) -> &str {
        self.meta.lease_token.as_deref().unwrap_or_default()
    }

    pub(crate) fn completed(mut self, now: DateTime<Utc>) -> Self {
        self.meta.state = JobState::Completed;
        self.meta.lease_expires_at = None;
        self.meta.finished_at = Some(now.timestamp_micros());
        self
    }

    pub(crate) fn with_attempt_failed(mut self, error: impl Into<String>) -> Self {
        self.meta.attempts += 1;
        self.meta.lease_expires_at = None;
        self.meta.last_error = Some(error.into());
        self
    }

    pub(crate) fn rescheduled(mut self, available_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        self.meta.available_at = available_at.timestamp_micros();
        self.meta.state = if available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        self
    }

    pub(crate) fn dead(mut self, now: DateTime<Utc>) -> Self {
        self.meta.state = JobState::Failed;
        self.meta.lease_expires_at = None;
        self.meta.finished_at = Some(now.timestamp_micros());
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.meta.available_at <= now.timestamp_micros()
    }
}

impl JobMeta {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.created_at).unwrap_or_else(Utc::now)
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.available_at).unwrap_or_else(Utc::now)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
            .and_then(DateTime::<Utc>::from_timestamp_micros)
    }

    pub fn latency_micros(&self) -> i64 {
        (Utc::now().timestamp_micros() - self.available_at).max(0)
    }

    pub fn latency_millis(&self) -> i64 {
        self.latency_micros() / 1000
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
