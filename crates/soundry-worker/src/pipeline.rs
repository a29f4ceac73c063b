//! Per-job state machine.
//!
//! A delivered job moves its track from `processing` to `completed`,
//! `failed` or `cancelled`:
//!
//! 1. metadata fetch (cached, `metadata` rate category), duration check
//! 2. dedupe against an available track for the same provider reference
//! 3. provider claim so only one job downloads a given reference
//! 4. Spotify references are resolved to a YouTube URL (`resolve` category)
//! 5. identity lease, download (`download` category), sequential transcodes
//! 6. atomic completion with the converted files
//!
//! Cancellation is checked at every step boundary. The identity is released
//! exactly once with the classified outcome and the circuit breaker records
//! exactly one outcome per attempt.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use soundry_media::{build_search_query, FailureClass, MediaPlatform, RequestIdentity, Transcoder};
use soundry_models::{
    AudioFormat, Clock, DownloadJob, Provider, ProviderRef, TrackFile, TrackId, TrackMetadata,
    TrackStatus,
};
use soundry_queue::Delivery;
use soundry_storage::LocalStorage;
use soundry_store::{CacheNamespace, TrackRepository, TtlCache};
use tracing::{debug, error, warn, Instrument};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::identity_pool::{IdentityLease, IdentityPool, ReleaseOutcome};
use crate::logging::JobLogger;
use crate::metrics;
use crate::rate_limiter::{RateCategory, RateLimiter};

/// How a job attempt ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Downloaded, converted and finalized.
    Completed,
    /// Linked to an existing available track; nothing was downloaded.
    Deduplicated,
    /// The track was cancelled or deleted; nothing was finalized.
    Cancelled,
    /// The track was not in a state this job should act on.
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Deduplicated => "deduplicated",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Scratch space; each job downloads into `<work_dir>/<job_id>`
    pub work_dir: PathBuf,
    pub max_track_duration_secs: u32,
    /// Bound on one attempt. Also the age after which a provider claim is stale.
    pub job_timeout: Duration,
    /// How long to wait on another job's claim before rescheduling
    pub claim_wait: Duration,
    pub claim_poll_interval: Duration,
    pub reschedule_delay: Duration,
    /// Search attempts for Spotify resolution, each with its own identity
    pub resolve_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/soundry"),
            max_track_duration_secs: 900,
            job_timeout: Duration::from_secs(1800),
            claim_wait: Duration::from_secs(60),
            claim_poll_interval: Duration::from_secs(2),
            reschedule_delay: Duration::from_secs(10),
            resolve_attempts: 2,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            max_track_duration_secs: config.max_track_duration_secs,
            job_timeout: config.job_timeout,
            ..Self::default()
        }
    }
}

/// Collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub tracks: Arc<dyn TrackRepository>,
    pub cache: TtlCache,
    pub storage: LocalStorage,
    pub platform: Arc<dyn MediaPlatform>,
    pub transcoder: Arc<dyn Transcoder>,
    pub limiter: RateLimiter,
    pub identities: IdentityPool,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: Arc<dyn Clock>,
}

pub struct JobPipeline {
    deps: PipelineDeps,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        Self { deps, settings }
    }

    /// Run one delivery to an outcome.
    ///
    /// Failures are recorded on the track before returning: permanent ones
    /// and those on the last attempt fail the track, earlier ones only keep
    /// the error. A `Reschedule` error asks the caller to put the job back
    /// without consuming an attempt.
    pub async fn run(&self, delivery: &Delivery) -> WorkerResult<JobOutcome> {
        let job = delivery.job();
        let logger = JobLogger::new(&job.job_id, &job.track_id, delivery.attempt);
        let span = logger.create_span();
        self.run_attempt(delivery, &logger).instrument(span).await
    }

    async fn run_attempt(
        &self,
        delivery: &Delivery,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let job = delivery.job();
        let started = Instant::now();
        logger.log_start(&job.source.to_string());
        metrics::record_job_started();

        let timeout = self.settings.job_timeout;
        let result = match tokio::time::timeout(timeout, self.execute(job, logger)).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon(job).await;
                Err(WorkerError::JobTimeout(self.settings.job_timeout))
            }
        };
        let result = match result {
            Err(WorkerError::Cancelled) => Ok(JobOutcome::Cancelled),
            other => other,
        };

        let healthy = match &result {
            Ok(_) => true,
            Err(e) => e.is_reschedule(),
        };
        self.deps.breaker.record(healthy).await;

        let elapsed = started.elapsed();
        match &result {
            Ok(outcome) => {
                logger.log_completion(&format!(
                    "{} in {:.1}s",
                    outcome.as_str(),
                    elapsed.as_secs_f64()
                ));
                metrics::record_job_finished(outcome.as_str(), elapsed.as_secs_f64());
            }
            Err(e) if e.is_reschedule() => {
                logger.log_warning(&e.to_string());
                metrics::record_job_rescheduled();
            }
            Err(e) => self.record_failure(delivery, e, logger).await,
        }
        result
    }

    async fn execute(&self, job: &DownloadJob, logger: &JobLogger) -> WorkerResult<JobOutcome> {
        match self.deps.tracks.track_status(&job.track_id).await? {
            None | Some(TrackStatus::Cancelled) => return Err(WorkerError::Cancelled),
            Some(TrackStatus::Processing) => {}
            Some(status) => {
                // Redelivered after finishing, or reverted by the dispatcher.
                debug!(status = %status, "Track is not processing, skipping");
                return Ok(JobOutcome::Skipped);
            }
        }

        let metadata = self.fetch_metadata(&job.source).await?;
        self.deps.tracks.update_metadata(&job.track_id, &metadata).await?;
        if let Some(duration_secs) = metadata.duration_secs {
            if duration_secs > self.settings.max_track_duration_secs {
                return Err(WorkerError::TrackTooLong {
                    duration_secs,
                    max_secs: self.settings.max_track_duration_secs,
                });
            }
        }
        logger.log_progress(&format!("metadata: {} - {}", metadata.artist, metadata.title));

        if let Some(outcome) = self.link_existing(job, logger).await? {
            return Ok(outcome);
        }

        let deadline = Instant::now() + self.settings.claim_wait;
        let mut waiting_logged = false;
        loop {
            self.ensure_active(&job.track_id).await?;
            if self.claim(job).await? {
                // The previous holder may have completed just before the claim.
                let result = match self.link_existing(job, logger).await {
                    Ok(Some(outcome)) => Ok(outcome),
                    Ok(None) => self.download_track(job, &metadata, logger).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = self.deps.tracks.release_claim(&job.source, &job.track_id).await {
                    warn!(error = %e, "Failed to release provider claim");
                }
                return result;
            }

            if !waiting_logged {
                let holder = self.deps.tracks.claim_holder(&job.source).await?;
                logger.log_progress(&format!(
                    "{} is being downloaded by track {}, waiting",
                    job.source,
                    holder.map(|id| id.to_string()).unwrap_or_default()
                ));
                waiting_logged = true;
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::reschedule(
                    format!("{} is still being downloaded by another job", job.source),
                    self.settings.reschedule_delay,
                ));
            }

            tokio::time::sleep(self.settings.claim_poll_interval).await;
            if let Some(outcome) = self.link_existing(job, logger).await? {
                return Ok(outcome);
            }
        }
    }

    async fn fetch_metadata(&self, source: &ProviderRef) -> WorkerResult<TrackMetadata> {
        let key = source.canonical_url();
        if let Some(cached) = self.deps.cache.get_json(CacheNamespace::Metadata, &key).await {
            metrics::record_cache_lookup(CacheNamespace::Metadata.as_str(), true);
            return Ok(cached);
        }
        metrics::record_cache_lookup(CacheNamespace::Metadata.as_str(), false);

        let metadata = self
            .deps
            .limiter
            .run(RateCategory::Metadata, self.deps.platform.fetch_metadata(source))
            .await?;
        self.deps.cache.set_json(CacheNamespace::Metadata, &key, &metadata).await;
        Ok(metadata)
    }

    /// Link this job's session items to an available track for the same
    /// source and drop the placeholder.
    async fn link_existing(
        &self,
        job: &DownloadJob,
        logger: &JobLogger,
    ) -> WorkerResult<Option<JobOutcome>> {
        let now = self.deps.clock.now();
        let Some(existing) = self.deps.tracks.find_available(&job.source, now).await? else {
            return Ok(None);
        };
        if !self.files_present(&existing.id).await? {
            warn!(existing = %existing.id, "Available track is missing files, not linking");
            return Ok(None);
        }
        let moved = self.deps.tracks.merge_into(&job.track_id, &existing.id).await?;
        logger.log_progress(&format!(
            "linked {moved} session item(s) to existing track {}",
            existing.id
        ));
        Ok(Some(JobOutcome::Deduplicated))
    }

    /// True when the track has files and every one of them is on disk.
    async fn files_present(&self, track_id: &TrackId) -> WorkerResult<bool> {
        let files = self.deps.tracks.files_for(track_id).await?;
        if files.is_empty() {
            return Ok(false);
        }
        for file in &files {
            if !self.deps.storage.exists(&file.path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn claim(&self, job: &DownloadJob) -> WorkerResult<bool> {
        let now = self.deps.clock.now();
        let stale_after = chrono::Duration::from_std(self.settings.job_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Ok(self
            .deps
            .tracks
            .claim_provider(&job.source, &job.track_id, now, now - stale_after)
            .await?)
    }

    async fn download_track(
        &self,
        job: &DownloadJob,
        metadata: &TrackMetadata,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let url = self.resolve_download_url(job, metadata, logger).await?;
        self.ensure_active(&job.track_id).await?;

        let lease = self.deps.identities.acquire().await?;
        logger.log_progress(&format!("downloading {url} as {}", lease.id()));

        let work_dir = self.work_dir_for(job);
        let result = self
            .download_and_convert(job, &url, &work_dir, lease.identity(), logger)
            .await;
        let outcome = match &result {
            Ok(_) => ReleaseOutcome::Success,
            Err(e) => release_outcome(e.failure_class()),
        };
        release_lease(lease, outcome);
        remove_work_dir(&work_dir).await;

        let files = result?;
        self.finalize(&job.track_id, files).await
    }

    async fn resolve_download_url(
        &self,
        job: &DownloadJob,
        metadata: &TrackMetadata,
        logger: &JobLogger,
    ) -> WorkerResult<String> {
        if job.source.provider != Provider::Spotify {
            return Ok(job.url.clone());
        }

        let query = build_search_query(&metadata.artist, &metadata.title);
        if let Some(url) = self.deps.cache.get(CacheNamespace::Resolver, &query).await {
            metrics::record_cache_lookup(CacheNamespace::Resolver.as_str(), true);
            return Ok(url);
        }
        metrics::record_cache_lookup(CacheNamespace::Resolver.as_str(), false);

        let mut last_error = None;
        for attempt in 1..=self.settings.resolve_attempts.max(1) {
            let lease = self.deps.identities.acquire().await?;
            let found = self
                .deps
                .limiter
                .run(RateCategory::Resolve, self.deps.platform.search(&query, lease.identity()))
                .await;
            match found {
                Ok(found) => {
                    release_lease(lease, ReleaseOutcome::Success);
                    let url = found.canonical_url();
                    self.deps.cache.set(CacheNamespace::Resolver, &query, &url).await;
                    logger.log_progress(&format!("resolved \"{query}\" to {url}"));
                    return Ok(url);
                }
                Err(e) => {
                    release_lease(lease, release_outcome(e.failure_class()));
                    logger.log_warning(&format!(
                        "search attempt {attempt} for \"{query}\" failed: {e}"
                    ));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(WorkerError::from)
            .unwrap_or_else(|| WorkerError::job_failed(format!("could not resolve \"{query}\""))))
    }

    async fn download_and_convert(
        &self,
        job: &DownloadJob,
        url: &str,
        work_dir: &Path,
        identity: &RequestIdentity,
        logger: &JobLogger,
    ) -> WorkerResult<Vec<TrackFile>> {
        tokio::fs::create_dir_all(work_dir).await?;

        let started = Instant::now();
        let source_file = {
            let _permit = self.deps.limiter.acquire(RateCategory::Download).await;
            self.deps.platform.download(url, work_dir, identity).await?
        };
        metrics::record_download_duration(started.elapsed().as_secs_f64());
        logger.log_progress(&format!("downloaded {}", source_file.display()));

        self.ensure_active(&job.track_id).await?;
        self.convert(job, &source_file).await
    }

    /// Transcode into every requested format, one after another. A failure
    /// removes whatever was already written.
    async fn convert(&self, job: &DownloadJob, source_file: &Path) -> WorkerResult<Vec<TrackFile>> {
        let formats = if job.formats.is_empty() {
            vec![AudioFormat::default()]
        } else {
            job.formats.clone()
        };

        self.deps.storage.prepare_track_dir(&job.track_id).await?;
        let mut files = Vec::with_capacity(formats.len());
        for format in formats {
            match self.convert_one(&job.track_id, source_file, format).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    let removed = self.deps.storage.delete_track(&job.track_id, &files).await;
                    if let Err(cleanup) = removed {
                        warn!(error = %cleanup, "Failed to remove partial conversions");
                    }
                    // A sweep may have reclaimed the track directory mid-transcode.
                    if let Err(WorkerError::Cancelled) = self.ensure_active(&job.track_id).await {
                        debug!(error = %e, "Conversion failed after the track was cancelled");
                        return Err(WorkerError::Cancelled);
                    }
                    return Err(e);
                }
            }
        }
        Ok(files)
    }

    async fn convert_one(
        &self,
        track_id: &TrackId,
        source_file: &Path,
        format: AudioFormat,
    ) -> WorkerResult<TrackFile> {
        let path = LocalStorage::relative_path(track_id, format);
        let dest = self.deps.storage.resolve(&path)?;

        let started = Instant::now();
        let size_bytes = self.deps.transcoder.transcode(source_file, &dest, format).await?;
        metrics::record_transcode_duration(format.as_str(), started.elapsed().as_secs_f64());

        Ok(TrackFile {
            format,
            path,
            size_bytes,
        })
    }

    async fn finalize(
        &self,
        track_id: &TrackId,
        files: Vec<TrackFile>,
    ) -> WorkerResult<JobOutcome> {
        let completed_at = self.deps.clock.now();
        if self.deps.tracks.complete_track(track_id, &files, completed_at).await? {
            return Ok(JobOutcome::Completed);
        }

        // Cancelled between the last check and completion.
        if let Err(e) = self.deps.storage.delete_track(track_id, &files).await {
            warn!(error = %e, "Failed to remove files of cancelled track");
        }
        Err(WorkerError::Cancelled)
    }

    async fn ensure_active(&self, track_id: &TrackId) -> WorkerResult<()> {
        match self.deps.tracks.track_status(track_id).await? {
            Some(TrackStatus::Processing) => Ok(()),
            _ => Err(WorkerError::Cancelled),
        }
    }

    async fn record_failure(&self, delivery: &Delivery, error: &WorkerError, logger: &JobLogger) {
        let message = error.to_string();
        let retryable = error.is_retryable();
        metrics::record_job_failed(retryable);

        let track_id = &delivery.job().track_id;
        if !retryable || delivery.is_last_attempt() {
            logger.log_error(&message);
            match self.deps.tracks.fail_track(track_id, &message).await {
                Ok(true) => {}
                Ok(false) => debug!("Track left processing before it could be failed"),
                Err(e) => error!(error = %e, "Failed to mark track failed"),
            }
        } else {
            logger.log_warning(&format!("attempt failed, will retry: {message}"));
            if let Err(e) = self.deps.tracks.record_error(track_id, &message).await {
                error!(error = %e, "Failed to record track error");
            }
        }
    }

    /// Clean up after an attempt that was cut off by the job timeout. The
    /// identity and rate limiter slots were released when their guards dropped.
    async fn abandon(&self, job: &DownloadJob) {
        if let Err(e) = self.deps.tracks.release_claim(&job.source, &job.track_id).await {
            warn!(error = %e, "Failed to release provider claim after timeout");
        }
        remove_work_dir(&self.work_dir_for(job)).await;
    }

    fn work_dir_for(&self, job: &DownloadJob) -> PathBuf {
        self.settings.work_dir.join(job.job_id.as_str())
    }
}

fn release_outcome(class: FailureClass) -> ReleaseOutcome {
    match class {
        FailureClass::Critical(reason) => ReleaseOutcome::CriticalFailure(reason),
        FailureClass::Transient => ReleaseOutcome::TransientFailure,
    }
}

fn release_lease(lease: IdentityLease, outcome: ReleaseOutcome) {
    let id = lease.id().to_string();
    if let Err(e) = lease.release(outcome) {
        error!(identity = %id, error = %e, "Failed to release identity");
    }
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove work directory"),
    }
}
