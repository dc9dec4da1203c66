//! Recurring job schedules.
//!
//! A [`RepeatingJobSpec`] pairs a job (name + payload) with a cron pattern and a
//! timezone. The launcher's repeating loop turns each due firing into an ordinary,
//! independent job through the [`Producer`](crate::Producer).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    CourierError, JobKind, job_envelope::EnqueueOptions, job_kind::queue_name_for,
    producer::Producer,
};

/// How long a firing claim is kept in the store.
const FIRING_CLAIM_TTL: Duration = Duration::from_secs(3600);
/// Firings older than this are skipped rather than caught up.
const MAX_CATCH_UP: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatingJobSpec {
    pub id: String,
    pub queue: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    /// 6 part cron pattern: `sec min hour day-of-month month day-of-week`.
    pub pattern: String,
    /// IANA timezone name the pattern is evaluated in.
    pub timezone: String,
    pub created_at: i64,
}

impl RepeatingJobSpec {
    /// Builds a spec evaluated in UTC. The id defaults to `job_name@pattern`.
    pub fn new(
        job_name: impl Into<String>,
        payload: serde_json::Value,
        pattern: impl Into<String>,
    ) -> Result<Self, CourierError> {
        let job_name = job_name.into();
        let pattern = pattern.into();
        let spec = Self {
            id: format!("{job_name}@{pattern}"),
            queue: queue_name_for(&job_name).to_string(),
            job_name,
            payload,
            pattern,
            timezone: "UTC".to_string(),
            created_at: Utc::now().timestamp_micros(),
        };
        spec.schedule()?;
        Ok(spec)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn in_timezone(mut self, timezone: impl Into<String>) -> Result<Self, CourierError> {
        self.timezone = timezone.into();
        self.tz()?;
        Ok(self)
    }

    pub fn schedule(&self) -> Result<cron::Schedule, CourierError> {
        cron::Schedule::from_str(&self.pattern).map_err(|source| CourierError::InvalidCron {
            pattern: self.pattern.clone(),
            source,
        })
    }

    pub fn tz(&self) -> Result<Tz, CourierError> {
        Tz::from_str(&self.timezone)
            .map_err(|_| CourierError::InvalidTimezone(self.timezone.clone()))
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CourierError> {
        let tz = self.tz()?;
        let schedule = self.schedule()?;
        Ok(schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)))
    }

    /// Firings in `(from, to]`, oldest first.
    pub fn due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, CourierError> {
        let tz = self.tz()?;
        let schedule = self.schedule()?;
        Ok(schedule
            .after(&from.with_timezone(&tz))
            .map(|at| at.with_timezone(&Utc))
            .take_while(|at| *at <= to)
            .collect())
    }
}

/// Fires every repeating spec of `queues` once per due firing until cancelled.
///
/// Each firing is claimed in the store first, so any number of processes can run
/// this loop against the same namespace without duplicating jobs.
pub(crate) async fn repeating_loop<J: JobKind>(
    producer: Producer<J>,
    queues: Vec<String>,
    tick: Duration,
    cancel_token: CancellationToken,
) -> Result<(), CourierError> {
    tracing::info!(queues = ?queues, "Starting repeating loop");

    let mut checked_until = Utc::now();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                return Ok(());
            }
            _ = tokio::time::sleep(tick) => {
                let now = Utc::now();
                let from = checked_until.max(now - MAX_CATCH_UP);
                match fire_due(&producer, &queues, from, now).await {
                    Ok(_) => checked_until = now,
                    Err(e) => {
                        tracing::warn!("Repeating loop cannot reach the store: {}", e);
                    }
                }
            }
        }
    }
}

/// Fires the firings in `(from, to]`. Only a store outage is returned; a queue or
/// spec that fails for any other reason is logged and skipped.
pub(crate) async fn fire_due<J: JobKind>(
    producer: &Producer<J>,
    queues: &[String],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<usize, CourierError> {
    let storage = producer.registry().storage();
    let mut fired = 0;

    for queue in queues {
        let specs = match storage.list_scheduled_jobs(queue).await {
            Ok(specs) => specs,
            Err(e) if e.is_store_unavailable() => return Err(e),
            Err(e) => {
                tracing::error!(queue = queue, "Skipping repeating jobs of queue: {}", e);
                continue;
            }
        };

        'specs: for spec in specs {
            let due = match spec.due_between(from, to) {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(spec = spec.id, queue = spec.queue, "Skipping repeating job: {}", e);
                    continue;
                }
            };

            for at in due {
                match storage.claim_firing(&spec.id, at, FIRING_CLAIM_TTL).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) if e.is_store_unavailable() => return Err(e),
                    Err(e) => {
                        tracing::error!(spec = spec.id, queue = spec.queue, "Skipping repeating job: {}", e);
                        continue 'specs;
                    }
                }
                let job_id = producer
                    .enqueue_repeat(&spec, EnqueueOptions::default())
                    .await;
                tracing::info!(
                    spec = spec.id,
                    queue = spec.queue,
                    job = spec.job_name,
                    job_id = job_id.as_deref().unwrap_or("-"),
                    scheduled_at = %at,
                    "Repeating job fired"
                );
                fired += 1;
            }
        }
    }

    Ok(fired)
}
