//! Broker contracts shared by the Redis and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soundry_models::{DownloadJob, JobPriority, RetryPolicy};
use std::time::Duration;

use crate::error::QueueResult;

/// A job as held by the broker between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job: DownloadJob,
    pub priority: JobPriority,
    pub policy: RetryPolicy,
    /// Failed attempts so far.
    #[serde(default)]
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn new(job: DownloadJob, priority: JobPriority, policy: RetryPolicy) -> Self {
        Self {
            job,
            priority,
            policy,
            attempts_made: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        self.job.job_id.as_str()
    }
}

/// One delivery of a job to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queued: QueuedJob,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
}

impl Delivery {
    pub(crate) fn of(queued: QueuedJob) -> Self {
        let attempt = queued.attempts_made + 1;
        Self { queued, attempt }
    }

    pub fn job(&self) -> &DownloadJob {
        &self.queued.job
    }

    pub fn is_last_attempt(&self) -> bool {
        self.queued.policy.is_last_attempt(self.attempt)
    }
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    DeadLettered,
}

/// A job that exhausted its attempts or failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queued: QueuedJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead: u64,
}

/// Producer side: lower priority values are serviced first.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn enqueue(
        &self,
        job: &DownloadJob,
        priority: JobPriority,
        policy: RetryPolicy,
    ) -> QueueResult<()>;
}

/// Consumer side, with at-least-once delivery.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Lease the next ready job, if any.
    async fn dequeue(&self) -> QueueResult<Option<Delivery>>;

    /// The delivery finished; forget the job.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// The delivery failed. Retryable failures with attempts left are
    /// scheduled after the policy's backoff; everything else is dead-lettered.
    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome>;

    /// Put the job back after `delay` without consuming an attempt.
    async fn reschedule(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    async fn depth(&self) -> QueueResult<QueueDepth>;
}

/// Decide the retry outcome for a failed delivery and update the job.
pub(crate) fn plan_failure(
    delivery: &Delivery,
    error: &str,
    retryable: bool,
) -> (QueuedJob, FailOutcome) {
    let mut queued = delivery.queued.clone();
    queued.attempts_made = delivery.attempt;
    queued.last_error = Some(error.to_string());

    let outcome = if retryable && !queued.policy.is_last_attempt(delivery.attempt) {
        FailOutcome::Retrying {
            delay: queued.policy.delay_after(delivery.attempt),
        }
    } else {
        FailOutcome::DeadLettered
    };
    (queued, outcome)
}
