//! Job queue on Redis sorted sets.
//!
//! Keys (with the configured prefix):
//! - `<p>:jobs:waiting` ZSET, score = priority * 1e13 + enqueue millis
//! - `<p>:jobs:delayed` ZSET, score = ready-at millis
//! - `<p>:jobs:active`  ZSET, score = lease deadline millis
//! - `<p>:jobs:data`    HASH job id -> JSON [`QueuedJob`]
//! - `<p>:jobs:rank`    HASH job id -> priority
//! - `<p>:jobs:dlq`     LIST of JSON [`DeadLetter`]

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use soundry_models::{DownloadJob, JobPriority, RetryPolicy};
use tracing::{debug, info, warn};

use crate::broker::{
    plan_failure, DeadLetter, Delivery, FailOutcome, JobBroker, JobSource, QueueDepth, QueuedJob,
};
use crate::error::QueueResult;

const PRIORITY_WEIGHT: f64 = 1e13;
const DLQ_MAX_LEN: isize = 1000;

/// Promote due delayed jobs, reclaim expired leases, then lease the
/// lowest-scored waiting job.
const DEQUEUE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local lease = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])

local function requeue(id)
    local prio = tonumber(redis.call('HGET', KEYS[5], id) or '5')
    redis.call('ZADD', KEYS[1], prio * weight + now, id)
end

for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
    redis.call('ZREM', KEYS[2], id)
    requeue(id)
end

for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
    redis.call('ZREM', KEYS[3], id)
    requeue(id)
end

while true do
    local popped = redis.call('ZPOPMIN', KEYS[1])
    if #popped == 0 then
        return false
    end
    local id = popped[1]
    local payload = redis.call('HGET', KEYS[4], id)
    if payload then
        redis.call('ZADD', KEYS[3], now + lease, id)
        return payload
    end
end
"#;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix
    pub prefix: String,
    /// How long a delivery may run before it is handed out again
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "soundry".to_string(),
            lease: Duration::from_secs(35 * 60),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            lease: std::env::var("QUEUE_LEASE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
        }
    }
}

struct Keys {
    waiting: String,
    delayed: String,
    active: String,
    data: String,
    rank: String,
    dlq: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            waiting: format!("{prefix}:jobs:waiting"),
            delayed: format!("{prefix}:jobs:delayed"),
            active: format!("{prefix}:jobs:active"),
            data: format!("{prefix}:jobs:data"),
            rank: format!("{prefix}:jobs:rank"),
            dlq: format!("{prefix}:jobs:dlq"),
        }
    }
}

/// Redis-backed job queue.
pub struct JobQueue {
    client: redis::Client,
    keys: Keys,
    lease: Duration,
    dequeue: redis::Script,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            keys: Keys::new(&config.prefix),
            lease: config.lease,
            dequeue: redis::Script::new(DEQUEUE_SCRIPT),
        })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn waiting_score(priority: JobPriority, now_ms: i64) -> f64 {
        f64::from(priority.value()) * PRIORITY_WEIGHT + now_ms as f64
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: isize) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(&self.keys.dlq, 0, limit - 1).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }
}

#[async_trait]
impl JobBroker for JobQueue {
    async fn enqueue(
        &self,
        job: &DownloadJob,
        priority: JobPriority,
        policy: RetryPolicy,
    ) -> QueueResult<()> {
        let queued = QueuedJob::new(job.clone(), priority, policy);
        let payload = serde_json::to_string(&queued)?;
        let id = queued.id();
        let score = Self::waiting_score(priority, Utc::now().timestamp_millis());
        let mut conn = self.conn().await?;

        redis::pipe()
            .atomic()
            .hset(&self.keys.data, id, &payload)
            .ignore()
            .hset(&self.keys.rank, id, priority.value())
            .ignore()
            .zadd(&self.keys.waiting, id, score)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(job_id = %id, track_id = %job.track_id, priority = priority.value(), "Enqueued job");
        Ok(())
    }
}

#[async_trait]
impl JobSource for JobQueue {
    async fn dequeue(&self) -> QueueResult<Option<Delivery>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = self
            .dequeue
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .key(&self.keys.data)
            .key(&self.keys.rank)
            .arg(Utc::now().timestamp_millis())
            .arg(self.lease.as_millis() as i64)
            .arg(PRIORITY_WEIGHT)
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str::<QueuedJob>(&payload) {
            Ok(queued) => {
                debug!(job_id = %queued.id(), attempt = queued.attempts_made + 1, "Leased job");
                Ok(Some(Delivery::of(queued)))
            }
            Err(e) => {
                // Undecodable payloads can never succeed; drop them.
                warn!(error = %e, "Dropping malformed job payload");
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let id = delivery.queued.id();
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .zrem(&self.keys.active, id)
            .ignore()
            .hdel(&self.keys.data, id)
            .ignore()
            .hdel(&self.keys.rank, id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(job_id = %id, "Acknowledged job");
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let (queued, outcome) = plan_failure(delivery, error, retryable);
        let id = queued.id().to_string();
        let mut conn = self.conn().await?;

        match outcome {
            FailOutcome::Retrying { delay } => {
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                redis::pipe()
                    .atomic()
                    .zrem(&self.keys.active, &id)
                    .ignore()
                    .hset(&self.keys.data, &id, serde_json::to_string(&queued)?)
                    .ignore()
                    .zadd(&self.keys.delayed, &id, ready_at)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                info!(
                    job_id = %id,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled retry"
                );
            }
            FailOutcome::DeadLettered => {
                let letter = DeadLetter {
                    queued,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                };
                redis::pipe()
                    .atomic()
                    .zrem(&self.keys.active, &id)
                    .ignore()
                    .hdel(&self.keys.data, &id)
                    .ignore()
                    .hdel(&self.keys.rank, &id)
                    .ignore()
                    .lpush(&self.keys.dlq, serde_json::to_string(&letter)?)
                    .ignore()
                    .ltrim(&self.keys.dlq, 0, DLQ_MAX_LEN - 1)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                warn!(job_id = %id, attempt = delivery.attempt, error, "Moved job to DLQ");
            }
        }
        Ok(outcome)
    }

    async fn reschedule(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let id = delivery.queued.id();
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .zrem(&self.keys.active, id)
            .ignore()
            .zadd(&self.keys.delayed, id, ready_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "Rescheduled job");
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn().await?;
        let (waiting, delayed, active, dead): (u64, u64, u64, u64) = redis::pipe()
            .zcard(&self.keys.waiting)
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.active)
            .llen(&self.keys.dlq)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            waiting,
            delayed,
            active,
            dead,
        })
    }
}
