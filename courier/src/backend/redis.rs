use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands, Script};
use std::{sync::LazyLock, time::Duration};
use uuid::Uuid;

use super::{Backend, QueueCounts, QueueListOpts, RetentionPolicy, WindowAcquire, micros, millis};
use crate::{
    CourierError,
    job_envelope::{JobEnvelope, JobId, JobState},
    repeating::RepeatingJobSpec,
    storage_keys::StorageKeys,
};

// Rewrites the state of a stored envelope to `waiting`. `meta` is the last field
// of a serialized envelope and `state` its first, so the last match is the real one.
const MARK_WAITING: &str = r#"
local function mark_waiting(jobs, id)
    local raw = redis.call('HGET', jobs, id)
    if not raw then
        return
    end
    local marker = '"meta":{"state":"'
    local last = nil
    local at = 1
    while true do
        local found = string.find(raw, marker, at, true)
        if not found then
            break
        end
        last = found
        at = found + 1
    end
    if last then
        local value = last + string.len(marker)
        local stop = string.find(raw, '"', value, true)
        redis.call('HSET', jobs, id, string.sub(raw, 1, value - 1) .. 'waiting' .. string.sub(raw, stop))
    end
end
"#;

// KEYS: waiting, delayed, active, jobs, leases. ARGV: now, lease expiry (micros), token.
// Promotes due delayed ids, then pops ids until one still has a record.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        "{MARK_WAITING}{}",
        r"
        local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[2], id)
            mark_waiting(KEYS[4], id)
            redis.call('LPUSH', KEYS[1], id)
        end
        while true do
            local id = redis.call('RPOP', KEYS[1])
            if not id then
                return false
            end
            local raw = redis.call('HGET', KEYS[4], id)
            if raw then
                redis.call('ZADD', KEYS[3], ARGV[2], id)
                redis.call('HSET', KEYS[5], id, ARGV[3])
                return {id, raw}
            end
        end
        "
    ))
});

// KEYS: active, leases. ARGV: id, new expiry, token.
static EXTEND_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[3] then
            redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

// KEYS: active, leases, jobs, target zset. ARGV: id, token, record, score.
// Stores the record and moves the id to the target only while the token holds the lease.
static FINISH_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
        redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
        return 1
        ",
    )
});

// KEYS: delayed, jobs. ARGV: id.
static CANCEL_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
            redis.call('HDEL', KEYS[2], ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

// KEYS: active, waiting, leases, jobs. ARGV: now. Reclaimed ids go to the consuming end.
static RECLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        "{MARK_WAITING}{}",
        r"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(expired) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('HDEL', KEYS[3], id)
            mark_waiting(KEYS[4], id)
            redis.call('RPUSH', KEYS[2], id)
        end
        return expired
        "
    ))
});

// KEYS: finished zset, jobs. ARGV: cutoff, count cap.
static PRUNE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local removed = 0
        local old = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(old) do
            redis.call('HDEL', KEYS[2], id)
            removed = removed + 1
        end
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local over = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[2])
        if over > 0 then
            local oldest = redis.call('ZRANGE', KEYS[1], 0, over - 1)
            for _, id in ipairs(oldest) do
                redis.call('HDEL', KEYS[2], id)
            end
            redis.call('ZREMRANGEBYRANK', KEYS[1], 0, over - 1)
            removed = removed + over
        end
        return removed
        ",
    )
});

// KEYS: counter. ARGV: limit, window (ms). Returns {granted, count, ttl ms}.
static WINDOW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local limit = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local count = tonumber(redis.call('GET', KEYS[1]) or '0')
        if count >= limit then
            local ttl = redis.call('PTTL', KEYS[1])
            if ttl < 0 then
                redis.call('PEXPIRE', KEYS[1], window)
                ttl = window
            end
            return {0, count, ttl}
        end
        count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], window)
        end
        return {1, count, redis.call('PTTL', KEYS[1])}
        ",
    )
});

// KEYS: slots. ARGV: limit, now (ms), expiry (ms), token. A held token gets the new expiry.
static SLOT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
        if redis.call('ZSCORE', KEYS[1], ARGV[4]) then
            redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
            return 1
        end
        if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[1]) then
            redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
            return 1
        end
        return 0
        ",
    )
});

/// [`Backend`] over a shared Redis instance.
///
/// Every multi-key transition runs as a Lua script or a `MULTI` pipeline, so any
/// number of processes can share one namespace.
#[derive(Clone)]
pub struct RedisBackend {
    pool: deadpool_redis::Pool,
    keys: StorageKeys,
}

impl RedisBackend {
    pub fn new(pool: deadpool_redis::Pool, namespace: Option<String>) -> Self {
        Self {
            pool,
            keys: StorageKeys::new(namespace.unwrap_or_default()),
        }
    }

    pub fn pool(&self) -> deadpool_redis::Pool {
        self.pool.clone()
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, CourierError> {
        self.pool
            .get()
            .await
            .map_err(CourierError::DeadpoolRedisPoolError)
    }

    async fn get_many(
        &self,
        redis: &mut deadpool_redis::Connection,
        ids: &[JobId],
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&self.keys.jobs);
        cmd.arg(ids);
        let envelopes_str: Vec<Option<String>> = cmd.query_async(&mut *redis).await?;
        let mut envelopes: Vec<JobEnvelope> = vec![];
        for envelope_str in envelopes_str.into_iter().flatten() {
            envelopes.push(serde_json::from_str(&envelope_str)?);
        }
        Ok(envelopes)
    }

    /// Releases the lease of `envelope`, stores it and files its id under `target`.
    async fn finish(
        &self,
        envelope: &JobEnvelope,
        target: &str,
        score: i64,
    ) -> Result<bool, CourierError> {
        let mut redis = self.connection().await?;
        let finished: i64 = FINISH_SCRIPT
            .key(self.keys.active(&envelope.queue))
            .key(self.keys.leases(&envelope.queue))
            .key(&self.keys.jobs)
            .key(target)
            .arg(&envelope.id)
            .arg(envelope.lease_token())
            .arg(serde_json::to_string(envelope)?)
            .arg(score)
            .invoke_async(&mut redis)
            .await?;
        Ok(finished == 1)
    }
}

fn range(opts: &QueueListOpts) -> Option<(isize, isize)> {
    if opts.count == 0 {
        return None;
    }
    let start = opts.offset.min(isize::MAX as usize) as isize;
    let stop = opts.offset.saturating_add(opts.count).min(isize::MAX as usize) as isize - 1;
    Some((start, stop))
}

#[async_trait]
impl Backend for RedisBackend {
    fn namespace(&self) -> &str {
        &self.keys.namespace
    }

    async fn push(&self, envelope: &JobEnvelope) -> Result<JobId, CourierError> {
        let mut redis = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.keys.jobs, &envelope.id, serde_json::to_string(envelope)?)
            .sadd(&self.keys.queues, &envelope.queue);

        match envelope.meta.state {
            JobState::Delayed => {
                pipe.zadd(
                    self.keys.delayed(&envelope.queue),
                    &envelope.id,
                    envelope.meta.available_at,
                );
            }
            _ => {
                pipe.lpush(self.keys.waiting(&envelope.queue), &envelope.id);
            }
        }

        let _: () = pipe.query_async(&mut redis).await?;
        Ok(envelope.id.clone())
    }

    async fn claim_next(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobEnvelope>, CourierError> {
        let mut redis = self.connection().await?;
        let expires_at = now.timestamp_micros().saturating_add(micros(lease));
        let token = Uuid::new_v4().to_string();

        let claimed: Option<(String, String)> = CLAIM_SCRIPT
            .key(self.keys.waiting(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.active(queue))
            .key(&self.keys.jobs)
            .key(self.keys.leases(queue))
            .arg(now.timestamp_micros())
            .arg(expires_at)
            .arg(&token)
            .invoke_async(&mut redis)
            .await?;

        let Some((id, raw)) = claimed else {
            return Ok(None);
        };

        let envelope: JobEnvelope = serde_json::from_str(&raw)?;
        let expires_at = DateTime::<Utc>::from_timestamp_micros(expires_at).unwrap_or(now);
        let envelope = envelope.claimed(expires_at, token);

        let _: () = redis
            .hset(&self.keys.jobs, &id, serde_json::to_string(&envelope)?)
            .await?;

        Ok(Some(envelope))
    }

    async fn extend_lease(
        &self,
        envelope: &JobEnvelope,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError> {
        let mut redis = self.connection().await?;
        let extended: i64 = EXTEND_SCRIPT
            .key(self.keys.active(&envelope.queue))
            .key(self.keys.leases(&envelope.queue))
            .arg(&envelope.id)
            .arg(now.timestamp_micros().saturating_add(micros(lease)))
            .arg(envelope.lease_token())
            .invoke_async(&mut redis)
            .await?;
        Ok(extended == 1)
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        let finished_at = envelope
            .meta
            .finished_at
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        self.finish(envelope, &self.keys.completed, finished_at).await
    }

    async fn retry(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        self.finish(
            envelope,
            &self.keys.delayed(&envelope.queue),
            envelope.meta.available_at,
        )
        .await
    }

    async fn kill(&self, envelope: &JobEnvelope) -> Result<bool, CourierError> {
        let finished_at = envelope
            .meta
            .finished_at
            .unwrap_or_else(|| Utc::now().timestamp_micros());
        self.finish(envelope, &self.keys.dead, finished_at).await
    }

    async fn cancel(&self, id: &str) -> Result<bool, CourierError> {
        let Some(envelope) = self.get_job(id).await? else {
            return Ok(false);
        };
        if envelope.meta.state != JobState::Delayed {
            return Ok(false);
        }

        let mut redis = self.connection().await?;
        let removed: i64 = CANCEL_SCRIPT
            .key(self.keys.delayed(&envelope.queue))
            .key(&self.keys.jobs)
            .arg(id)
            .invoke_async(&mut redis)
            .await?;
        Ok(removed == 1)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, CourierError> {
        let mut reclaimed = 0;
        for queue in self.list_queue_names().await? {
            let mut redis = self.connection().await?;
            let job_ids: Vec<String> = RECLAIM_SCRIPT
                .key(self.keys.active(&queue))
                .key(self.keys.waiting(&queue))
                .key(self.keys.leases(&queue))
                .key(&self.keys.jobs)
                .arg(now.timestamp_micros())
                .invoke_async(&mut redis)
                .await?;

            for job_id in &job_ids {
                tracing::info!(job_id = job_id, queue = queue, "Reclaiming expired lease");
            }
            reclaimed += job_ids.len();
        }
        Ok(reclaimed)
    }

    async fn prune(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, CourierError> {
        let mut redis = self.connection().await?;
        let now = now.timestamp_micros();

        let completed: usize = PRUNE_SCRIPT
            .key(&self.keys.completed)
            .key(&self.keys.jobs)
            .arg(now - micros(retention.completed_age))
            .arg(retention.completed_count)
            .invoke_async(&mut redis)
            .await?;
        let dead: usize = PRUNE_SCRIPT
            .key(&self.keys.dead)
            .key(&self.keys.jobs)
            .arg(now - micros(retention.dead_age))
            .arg(retention.dead_count)
            .invoke_async(&mut redis)
            .await?;

        Ok(completed + dead)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobEnvelope>, CourierError> {
        let mut redis = self.connection().await?;
        let envelope: Option<String> = redis.hget(&self.keys.jobs, id).await?;
        match envelope {
            Some(envelope) => Ok(Some(serde_json::from_str(&envelope)?)),
            None => Ok(None),
        }
    }

    async fn list_queue_names(&self) -> Result<Vec<String>, CourierError> {
        let mut redis = self.connection().await?;
        let mut queues: Vec<String> = redis.smembers(&self.keys.queues).await?;
        queues.sort();
        Ok(queues)
    }

    async fn list_waiting(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        let mut redis = self.connection().await?;
        let Some((start, stop)) = range(opts) else {
            return Ok(vec![]);
        };
        let job_ids: Vec<JobId> = redis.lrange(self.keys.waiting(queue), start, stop).await?;
        self.get_many(&mut redis, &job_ids).await
    }

    async fn list_delayed(
        &self,
        queue: &str,
        opts: &QueueListOpts,
    ) -> Result<Vec<JobEnvelope>, CourierError> {
        let mut redis = self.connection().await?;
        let Some((start, stop)) = range(opts) else {
            return Ok(vec![]);
        };
        let job_ids: Vec<JobId> = redis.zrange(self.keys.delayed(queue), start, stop).await?;
        self.get_many(&mut redis, &job_ids).await
    }

    async fn list_dead(&self, opts: &QueueListOpts) -> Result<Vec<JobEnvelope>, CourierError> {
        let mut redis = self.connection().await?;
        let Some((start, stop)) = range(opts) else {
            return Ok(vec![]);
        };
        let job_ids: Vec<JobId> = redis.zrevrange(&self.keys.dead, start, stop).await?;
        self.get_many(&mut redis, &job_ids).await
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, CourierError> {
        let mut redis = self.connection().await?;
        let (waiting, delayed, active): (usize, usize, usize) = redis::pipe()
            .llen(self.keys.waiting(queue))
            .zcard(self.keys.delayed(queue))
            .zcard(self.keys.active(queue))
            .query_async(&mut redis)
            .await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
        })
    }

    async fn completed_count(&self) -> Result<usize, CourierError> {
        let mut redis = self.connection().await?;
        let count: usize = redis.zcard(&self.keys.completed).await?;
        Ok(count)
    }

    async fn dead_count(&self) -> Result<usize, CourierError> {
        let mut redis = self.connection().await?;
        let count: usize = redis.zcard(&self.keys.dead).await?;
        Ok(count)
    }

    async fn save_repeating(&self, spec: &RepeatingJobSpec) -> Result<(), CourierError> {
        let mut redis = self.connection().await?;
        let _: () = redis::pipe()
            .hset(
                self.keys.repeat(&spec.queue),
                &spec.id,
                serde_json::to_string(spec)?,
            )
            .sadd(&self.keys.queues, &spec.queue)
            .query_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn list_repeating(&self, queue: &str) -> Result<Vec<RepeatingJobSpec>, CourierError> {
        let mut redis = self.connection().await?;
        let values: Vec<String> = redis.hvals(self.keys.repeat(queue)).await?;
        let mut specs = values
            .iter()
            .map(|value| serde_json::from_str::<RepeatingJobSpec>(value))
            .collect::<Result<Vec<_>, _>>()?;
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(specs)
    }

    async fn remove_repeating(&self, queue: &str, id: &str) -> Result<bool, CourierError> {
        let mut redis = self.connection().await?;
        let removed: i64 = redis.hdel(self.keys.repeat(queue), id).await?;
        Ok(removed == 1)
    }

    async fn claim_firing(
        &self,
        spec_id: &str,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut redis = self.connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.keys.firing(spec_id, at.timestamp_micros()))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl).max(1))
            .query_async(&mut redis)
            .await?;
        Ok(set.is_some())
    }

    async fn window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<WindowAcquire, CourierError> {
        let mut redis = self.connection().await?;
        let (granted, count, ttl_ms): (i64, u64, i64) = WINDOW_SCRIPT
            .key(self.keys.window(key))
            .arg(limit)
            .arg(millis(window).max(1))
            .invoke_async(&mut redis)
            .await?;
        Ok(WindowAcquire {
            granted: granted == 1,
            count,
            reset_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn slot_acquire(
        &self,
        key: &str,
        limit: u64,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CourierError> {
        let mut redis = self.connection().await?;
        let now_ms = now.timestamp_millis();
        let acquired: i64 = SLOT_SCRIPT
            .key(self.keys.slots(key))
            .arg(limit)
            .arg(now_ms)
            .arg(now_ms.saturating_add(millis(ttl)))
            .arg(token)
            .invoke_async(&mut redis)
            .await?;
        Ok(acquired == 1)
    }

    async fn slot_release(&self, key: &str, token: &str) -> Result<(), CourierError> {
        let mut redis = self.connection().await?;
        let _: () = redis.zrem(self.keys.slots(key), token).await?;
        Ok(())
    }
}
