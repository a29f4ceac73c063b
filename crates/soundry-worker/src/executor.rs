//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use soundry_queue::{Delivery, DispatchNotifier, DispatchReason, FailOutcome, JobSource};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::JobPipeline;
use crate::retry::{retry_async, RetryConfig};

/// Pulls deliveries from the broker and runs them through the pipeline,
/// at most `max_concurrent_jobs` at a time.
pub struct JobExecutor {
    config: WorkerConfig,
    source: Arc<dyn JobSource>,
    pipeline: Arc<JobPipeline>,
    notifier: Arc<dyn DispatchNotifier>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn JobSource>,
        pipeline: Arc<JobPipeline>,
        notifier: Arc<dyn DispatchNotifier>,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            source,
            pipeline,
            notifier,
            job_semaphore,
            shutdown,
        }
    }

    /// Consume until [`shutdown`](Self::shutdown) is called, then wait for
    /// in-flight jobs up to the shutdown timeout.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting job executor"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping executor");
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.consume_one() => {
                    if let Err(e) = result {
                        error!(error = %e, "Error consuming jobs");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with jobs still running");
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn consume_one(&self) -> WorkerResult<()> {
        let permit = self
            .job_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

        let Some(delivery) = self.source.dequeue().await? else {
            drop(permit);
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        };
        debug!(
            job_id = %delivery.job().job_id,
            attempt = delivery.attempt,
            "Dequeued job"
        );

        let pipeline = Arc::clone(&self.pipeline);
        let source = Arc::clone(&self.source);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let _permit = permit;
            Self::execute_job(pipeline, source, notifier, delivery).await;
        });
        Ok(())
    }

    /// Run one delivery and settle it with the broker.
    async fn execute_job(
        pipeline: Arc<JobPipeline>,
        source: Arc<dyn JobSource>,
        notifier: Arc<dyn DispatchNotifier>,
        delivery: Delivery,
    ) {
        let job_id = delivery.job().job_id.clone();
        let source = source.as_ref();
        let delivery = &delivery;

        match pipeline.run(delivery).await {
            Ok(_) => {
                let config = RetryConfig::new("broker_ack");
                if let Err(e) = retry_async(&config, || source.ack(delivery)).await {
                    error!(job_id = %job_id, error = %e, "Failed to ack job");
                }
            }
            Err(WorkerError::Reschedule { reason, delay }) => {
                info!(
                    job_id = %job_id,
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Rescheduling job"
                );
                let config = RetryConfig::new("broker_reschedule");
                if let Err(e) = retry_async(&config, || source.reschedule(delivery, delay)).await {
                    error!(job_id = %job_id, error = %e, "Failed to reschedule job");
                }
            }
            Err(e) => {
                let message = e.to_string();
                let retryable = e.is_retryable();
                let config = RetryConfig::new("broker_fail");
                match retry_async(&config, || source.fail(delivery, &message, retryable)).await {
                    Ok(FailOutcome::Retrying { delay }) => {
                        info!(
                            job_id = %job_id,
                            attempt = delivery.attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Job will be retried"
                        );
                    }
                    Ok(FailOutcome::DeadLettered) => {
                        warn!(
                            job_id = %job_id,
                            attempt = delivery.attempt,
                            "Job moved to dead letters"
                        );
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "Failed to record job failure"),
                }
            }
        }

        if let Err(e) = notifier.notify(DispatchReason::JobFinished).await {
            warn!(job_id = %job_id, error = %e, "Failed to publish dispatch trigger");
        }
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
