//! Periodic reclamation of tracks and their artifacts.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use soundry_models::{Clock, TrackId, TrackStatus};
use soundry_storage::LocalStorage;
use soundry_store::TrackRepository;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::guard::RunGuard;
use crate::metrics;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub cancelled: usize,
    pub over_cap: usize,
    pub errors: usize,
}

impl CleanupReport {
    pub fn reclaimed(&self) -> usize {
        self.expired + self.cancelled + self.over_cap
    }
}

pub struct CleanupSweep {
    tracks: Arc<dyn TrackRepository>,
    storage: LocalStorage,
    clock: Arc<dyn Clock>,
    max_active_tracks: u64,
    running: AtomicBool,
}

impl CleanupSweep {
    pub fn new(
        tracks: Arc<dyn TrackRepository>,
        storage: LocalStorage,
        clock: Arc<dyn Clock>,
        max_active_tracks: u64,
    ) -> Self {
        Self {
            tracks,
            storage,
            clock,
            max_active_tracks,
            running: AtomicBool::new(false),
        }
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Starting cleanup sweep (interval: {:?})", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(Some(report)) if report.reclaimed() > 0 || report.errors > 0 => {
                    info!(
                        expired = report.expired,
                        cancelled = report.cancelled,
                        over_cap = report.over_cap,
                        errors = report.errors,
                        "Cleanup sweep complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Cleanup sweep error: {}", e),
            }
        }

        info!("Cleanup sweep stopped");
    }

    /// Reclaim expired and cancelled tracks, then trim the oldest tracks
    /// beyond the cap. A failed reclaim is logged and retried next sweep.
    /// Returns `None` if a sweep is already running.
    pub async fn run_once(&self) -> SchedulerResult<Option<CleanupReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            debug!("Cleanup sweep already in progress, skipping");
            return Ok(None);
        };
        self.sweep().await.map(Some)
    }

    async fn sweep(&self) -> SchedulerResult<CleanupReport> {
        let mut report = CleanupReport::default();

        let expired = self.tracks.list_expired(self.clock.now()).await?;
        report.expired = self.reclaim_all(&expired, "expired", &mut report.errors).await;

        let cancelled = self.tracks.list_by_status(TrackStatus::Cancelled).await?;
        report.cancelled = self.reclaim_all(&cancelled, "cancelled", &mut report.errors).await;

        let total = self.tracks.count_tracks().await?;
        if total > self.max_active_tracks {
            let surplus = total - self.max_active_tracks;
            warn!(
                total,
                cap = self.max_active_tracks,
                surplus,
                "Track cap exceeded, reclaiming oldest"
            );
            let oldest = self.tracks.oldest_tracks(surplus).await?;
            report.over_cap = self.reclaim_all(&oldest, "over_cap", &mut report.errors).await;
        }

        Ok(report)
    }

    async fn reclaim_all(
        &self,
        ids: &[TrackId],
        reason: &'static str,
        errors: &mut usize,
    ) -> usize {
        let mut reclaimed = 0;
        for id in ids {
            match self.reclaim(id).await {
                Ok(()) => {
                    debug!(track_id = %id, reason, "Reclaimed track");
                    metrics::record_reclaimed(reason);
                    reclaimed += 1;
                }
                Err(e) => {
                    error!(track_id = %id, reason, error = %e, "Failed to reclaim track");
                    metrics::record_cleanup_error();
                    *errors += 1;
                }
            }
        }
        reclaimed
    }

    /// Files first, then the row. The row outlives a failed file deletion
    /// so the next sweep finds the track again.
    async fn reclaim(&self, id: &TrackId) -> SchedulerResult<()> {
        let files = self.tracks.files_for(id).await?;
        self.storage.delete_track(id, &files).await?;
        self.tracks.delete_track(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use soundry_models::{
        AudioFormat, ItemSource, ManualClock, ProviderRef, SessionItem, Track, TrackFile,
    };
    use soundry_store::Database;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Setup {
        db: Database,
        storage: LocalStorage,
        clock: Arc<ManualClock>,
        sweep: CleanupSweep,
        _dir: TempDir,
    }

    async fn setup(cap: u64) -> Setup {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let storage = LocalStorage::new(dir.path());
        let clock = Arc::new(ManualClock::default());
        let sweep = CleanupSweep::new(db.tracks(), storage.clone(), clock.clone(), cap);
        Setup {
            db,
            storage,
            clock,
            sweep,
            _dir: dir,
        }
    }

    impl Setup {
        /// A completed track with one mp3 on disk, finished at `completed_at`.
        async fn completed(&self, video: &str, completed_at: DateTime<Utc>) -> (TrackId, String) {
            let source = ProviderRef::youtube(video);
            let track = Track::queued(source, vec![AudioFormat::Mp3], completed_at);
            self.db.tracks().create_track(&track).await.unwrap();
            let item = SessionItem::new(
                "session",
                track.id.clone(),
                None,
                ItemSource::Requested,
                completed_at,
            );
            self.db.sessions().create_item(&item).await.unwrap();
            self.db
                .tracks()
                .transition(&track.id, TrackStatus::Queued, TrackStatus::Processing)
                .await
                .unwrap();

            self.storage.prepare_track_dir(&track.id).await.unwrap();
            let relative = LocalStorage::relative_path(&track.id, AudioFormat::Mp3);
            tokio::fs::write(self.storage.resolve(&relative).unwrap(), b"audio")
                .await
                .unwrap();
            let files = vec![TrackFile {
                format: AudioFormat::Mp3,
                path: relative.clone(),
                size_bytes: 5,
            }];
            self.db
                .tracks()
                .complete_track(&track.id, &files, completed_at)
                .await
                .unwrap();
            (track.id, relative)
        }
    }

    #[tokio::test]
    async fn test_expired_track_is_reclaimed() {
        let s = setup(500).await;
        let now = s.clock.now();
        let expires_in_past = now - ChronoDuration::hours(24) - ChronoDuration::milliseconds(1);
        let (expired, expired_file) = s.completed("aaaaaaaaaaa", expires_in_past).await;
        let (fresh, fresh_file) = s.completed("bbbbbbbbbbb", now).await;

        let report = s.sweep.run_once().await.unwrap().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.errors, 0);

        assert!(s.db.tracks().get_track(&expired).await.unwrap().is_none());
        assert!(!s.storage.exists(&expired_file).await.unwrap());
        assert!(s.db.sessions().items_for_track(&expired).await.unwrap().is_empty());

        assert!(s.db.tracks().get_track(&fresh).await.unwrap().is_some());
        assert!(s.storage.exists(&fresh_file).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_track_is_reclaimed() {
        let s = setup(500).await;
        let track = Track::queued(ProviderRef::youtube("ccccccccccc"), vec![], s.clock.now());
        s.db.tracks().create_track(&track).await.unwrap();
        s.db.tracks()
            .transition(&track.id, TrackStatus::Queued, TrackStatus::Cancelled)
            .await
            .unwrap();

        let report = s.sweep.run_once().await.unwrap().unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(s.db.tracks().count_tracks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cap_reclaims_oldest() {
        let s = setup(500).await;
        let base = s.clock.now() - ChronoDuration::hours(2);
        let mut ids = Vec::new();
        for n in 0..501 {
            let at = base + ChronoDuration::seconds(n);
            let track = Track::queued(ProviderRef::youtube(format!("track-{n}")), vec![], at);
            s.db.tracks().create_track(&track).await.unwrap();
            ids.push(track.id);
        }

        let report = s.sweep.run_once().await.unwrap().unwrap();
        assert_eq!(report.over_cap, 1);
        assert_eq!(s.db.tracks().count_tracks().await.unwrap(), 500);
        assert!(s.db.tracks().get_track(&ids[0]).await.unwrap().is_none());
        assert!(s.db.tracks().get_track(&ids[1]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let s = setup(500).await;
        s.sweep.running.store(true, Ordering::SeqCst);
        assert!(s.sweep.run_once().await.unwrap().is_none());

        s.sweep.running.store(false, Ordering::SeqCst);
        assert!(s.sweep.run_once().await.unwrap().is_some());
        assert!(!s.sweep.running.load(Ordering::SeqCst));
    }
}
