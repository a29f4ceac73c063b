//! In-process broker with the same ordering and retry semantics as the Redis
//! queue. Used for single-process runs and tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use soundry_models::{DownloadJob, JobPriority, RetryPolicy};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{
    plan_failure, DeadLetter, Delivery, FailOutcome, JobBroker, JobSource, QueueDepth, QueuedJob,
};
use crate::error::{QueueError, QueueResult};

#[derive(Default)]
struct MemoryState {
    seq: u64,
    /// (priority, arrival sequence) -> job id
    waiting: BTreeMap<(u8, u64), String>,
    delayed: Vec<(Instant, String)>,
    active: HashMap<String, Instant>,
    jobs: HashMap<String, QueuedJob>,
    dead: Vec<DeadLetter>,
}

impl MemoryState {
    fn push_waiting(&mut self, id: String, priority: JobPriority) {
        self.seq += 1;
        self.waiting.insert((priority.value(), self.seq), id);
    }

    /// Move due delayed jobs and expired leases back to waiting.
    fn promote(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = later;
        for (_, id) in due {
            if let Some(priority) = self.jobs.get(&id).map(|j| j.priority) {
                self.push_waiting(id, priority);
            }
        }

        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.active.remove(&id);
            if let Some(priority) = self.jobs.get(&id).map(|j| j.priority) {
                warn!(job_id = %id, "Lease expired, redelivering");
                self.push_waiting(id, priority);
            }
        }
    }
}

pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    lease: Duration,
}

impl MemoryQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lease,
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(35 * 60))
    }
}

#[async_trait]
impl JobBroker for MemoryQueue {
    async fn enqueue(
        &self,
        job: &DownloadJob,
        priority: JobPriority,
        policy: RetryPolicy,
    ) -> QueueResult<()> {
        let queued = QueuedJob::new(job.clone(), priority, policy);
        let id = queued.id().to_string();
        let mut state = self.state.lock();
        if state.jobs.contains_key(&id) {
            return Err(QueueError::enqueue_failed(format!("duplicate job {id}")));
        }
        state.jobs.insert(id.clone(), queued);
        state.push_waiting(id.clone(), priority);
        debug!(job_id = %id, priority = priority.value(), "Enqueued job");
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn dequeue(&self) -> QueueResult<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.promote(now);

        while let Some((_, id)) = state.waiting.pop_first() {
            if let Some(queued) = state.jobs.get(&id).cloned() {
                state.active.insert(id, now + self.lease);
                return Ok(Some(Delivery::of(queued)));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let id = delivery.queued.id();
        let mut state = self.state.lock();
        state.active.remove(id);
        state.jobs.remove(id);
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
        let mut state = self.state.lock();
        state.active.remove(&id);

        match outcome {
            FailOutcome::Retrying { delay } => {
                state.jobs.insert(id.clone(), queued);
                state.delayed.push((Instant::now() + delay, id));
            }
            FailOutcome::DeadLettered => {
                state.jobs.remove(&id);
                state.dead.push(DeadLetter {
                    queued,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
        Ok(outcome)
    }

    async fn reschedule(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        let id = delivery.queued.id().to_string();
        let mut state = self.state.lock();
        if state.active.remove(&id).is_none() && !state.jobs.contains_key(&id) {
            return Err(QueueError::job_not_found(id));
        }
        state.delayed.push((Instant::now() + delay, id));
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.state.lock();
        Ok(QueueDepth {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            dead: state.dead.len() as u64,
        })
    }
}
