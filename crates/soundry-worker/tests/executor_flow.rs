//! Executor end-to-end over the in-memory broker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use soundry_media::{MediaPlatform, MediaResult, RequestIdentity, Transcoder};
use soundry_models::{
    AudioFormat, Clock, DownloadJob, ItemSource, JobPriority, ProviderRef, RetryPolicy, SessionItem,
    SystemClock, Track, TrackMetadata, TrackStatus,
};
use soundry_queue::{JobBroker, JobSource, LocalDispatch, LocalSafeMode, MemoryQueue};
use soundry_storage::LocalStorage;
use soundry_store::{Database, TtlCache};
use soundry_worker::{
    CircuitBreaker, CircuitBreakerConfig, IdentityPool, IdentityPoolConfig, JobExecutor,
    JobPipeline, PipelineDeps, PipelineSettings, RateLimiter, WorkerConfig,
};
use tempfile::TempDir;

struct FakePlatform {
    duration_secs: u32,
}

#[async_trait]
impl MediaPlatform for FakePlatform {
    async fn fetch_metadata(&self, source: &ProviderRef) -> MediaResult<TrackMetadata> {
        Ok(TrackMetadata {
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            duration_secs: Some(self.duration_secs),
            external_id: source.external_id.clone(),
        })
    }

    async fn search(&self, _query: &str, _identity: &RequestIdentity) -> MediaResult<ProviderRef> {
        Ok(ProviderRef::youtube("dQw4w9WgXcQ"))
    }

    async fn download(
        &self,
        _url: &str,
        dest_dir: &Path,
        _identity: &RequestIdentity,
    ) -> MediaResult<PathBuf> {
        let path = dest_dir.join("source.m4a");
        tokio::fs::write(&path, b"audio").await?;
        Ok(path)
    }
}

struct CopyTranscoder;

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn transcode(
        &self,
        source: &Path,
        dest: &Path,
        _format: AudioFormat,
    ) -> MediaResult<u64> {
        Ok(tokio::fs::copy(source, dest).await?)
    }
}

struct Setup {
    db: Database,
    queue: Arc<MemoryQueue>,
    dispatch: Arc<LocalDispatch>,
    executor: Arc<JobExecutor>,
    _dirs: TempDir,
}

async fn setup(duration_secs: u32) -> Setup {
    let dirs = TempDir::new().unwrap();
    let db = Database::in_memory().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = RateLimiter::new(2);

    let deps = PipelineDeps {
        tracks: db.tracks(),
        cache: TtlCache::new(db.cache(), clock.clone()),
        storage: LocalStorage::new(dirs.path().join("downloads")),
        platform: Arc::new(FakePlatform { duration_secs }),
        transcoder: Arc::new(CopyTranscoder),
        limiter: limiter.clone(),
        identities: IdentityPool::from_sources(vec![], vec![], IdentityPoolConfig::default()),
        breaker: Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            Arc::new(limiter),
            Arc::new(LocalSafeMode::default()),
        )),
        clock,
    };
    let settings = PipelineSettings {
        work_dir: dirs.path().join("work"),
        ..PipelineSettings::default()
    };
    let pipeline = Arc::new(JobPipeline::new(deps, settings));

    let queue = Arc::new(MemoryQueue::default());
    let dispatch = Arc::new(LocalDispatch::new());
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    };
    let executor = Arc::new(JobExecutor::new(config, queue.clone(), pipeline, dispatch.clone()));

    Setup {
        db,
        queue,
        dispatch,
        executor,
        _dirs: dirs,
    }
}

/// Admit a track the way the dispatcher leaves it: processing and enqueued.
async fn enqueue_track(s: &Setup) -> DownloadJob {
    let source = ProviderRef::youtube("dQw4w9WgXcQ");
    let now = Utc::now();
    let track = Track::queued(source.clone(), vec![AudioFormat::Mp3], now);
    s.db.tracks().create_track(&track).await.unwrap();
    let item = SessionItem::new("session", track.id.clone(), None, ItemSource::Requested, now);
    s.db.sessions().create_item(&item).await.unwrap();
    s.db.tracks()
        .transition(&track.id, TrackStatus::Queued, TrackStatus::Processing)
        .await
        .unwrap();

    let job = DownloadJob::new(track.id, "session", None, source, vec![AudioFormat::Mp3]);
    s.queue
        .enqueue(&job, JobPriority::Single, RetryPolicy::default())
        .await
        .unwrap();
    job
}

async fn run_until_job_finished(s: &Setup) {
    let executor = Arc::clone(&s.executor);
    let handle = tokio::spawn(async move { executor.run().await });

    tokio::time::timeout(Duration::from_secs(10), s.dispatch.notified())
        .await
        .expect("job did not finish");

    s.executor.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_executor_completes_and_acks() {
    let s = setup(200).await;
    let job = enqueue_track(&s).await;

    run_until_job_finished(&s).await;

    let track = s.db.tracks().get_track(&job.track_id).await.unwrap().unwrap();
    assert_eq!(track.status, TrackStatus::Completed);
    let depth = s.queue.depth().await.unwrap();
    assert_eq!(depth.waiting + depth.active + depth.delayed + depth.dead, 0);
}

#[tokio::test]
async fn test_permanent_failure_is_dead_lettered() {
    let s = setup(3600).await;
    let job = enqueue_track(&s).await;

    run_until_job_finished(&s).await;

    let track = s.db.tracks().get_track(&job.track_id).await.unwrap().unwrap();
    assert_eq!(track.status, TrackStatus::Failed);
    let dead = s.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.contains("limit is 900s"));
}
