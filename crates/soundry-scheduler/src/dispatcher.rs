//! Group-fair dispatcher.
//!
//! Each run promotes at most one queued item per group (a playlist, or a
//! session's loose tracks) and only while that group has fewer than
//! `group_cap` items processing. Runs happen on a fixed interval and on
//! every dispatch trigger; a trigger that arrives while a run is in
//! progress is a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use soundry_models::{DownloadJob, GroupKey, RetryPolicy, TrackStatus};
use soundry_queue::{DispatchReason, JobBroker, SafeModeFlag};
use soundry_store::{SessionRepository, TrackRepository, WorkItem};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::guard::RunGuard;
use crate::metrics;

pub type TriggerStream = Pin<Box<dyn Stream<Item = DispatchReason> + Send>>;

/// Summary of one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub queued: usize,
    pub groups: usize,
    pub promoted: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    tracks: Arc<dyn TrackRepository>,
    sessions: Arc<dyn SessionRepository>,
    broker: Arc<dyn JobBroker>,
    safe_mode: Arc<dyn SafeModeFlag>,
    group_cap: usize,
    policy: RetryPolicy,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        tracks: Arc<dyn TrackRepository>,
        sessions: Arc<dyn SessionRepository>,
        broker: Arc<dyn JobBroker>,
        safe_mode: Arc<dyn SafeModeFlag>,
        group_cap: usize,
    ) -> Self {
        Self {
            tracks,
            sessions,
            broker,
            safe_mode,
            group_cap: group_cap.max(1),
            policy: RetryPolicy::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Run on `interval` and on every trigger until `shutdown` flips.
    ///
    /// Each run is spawned so a slow run never delays the next trigger;
    /// overlapping runs are suppressed by [`run_once`](Self::run_once).
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut triggers: Option<TriggerStream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = interval.as_millis() as u64,
            group_cap = self.group_cap,
            "Starting dispatcher"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                reason = next_trigger(&mut triggers) => match reason {
                    Some(reason) => debug!(reason = reason.as_str(), "Dispatch triggered"),
                    None => {
                        warn!("Dispatch trigger stream ended, continuing on interval only");
                        triggers = None;
                        continue;
                    }
                },
            }

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run_once().await {
                    error!(error = %e, "Dispatch run failed");
                }
            });
        }

        info!("Dispatcher stopped");
    }

    /// One reconciliation pass. Returns `None` when another run is in progress.
    pub async fn run_once(&self) -> SchedulerResult<Option<DispatchReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            debug!("Dispatch run already in progress, skipping");
            return Ok(None);
        };
        let started = Instant::now();

        let items = self.sessions.list_work_items().await?;
        let safe_mode = match self.safe_mode.is_set().await {
            Ok(set) => set,
            Err(e) => {
                // Unknown breaker state: hold back playlist work.
                warn!(error = %e, "Could not read safe mode flag, assuming it is set");
                true
            }
        };

        let plan = plan_promotions(&items, safe_mode, self.group_cap);
        let mut report = DispatchReport {
            queued: plan.queued,
            groups: plan.groups,
            ..DispatchReport::default()
        };

        for item in plan.candidates {
            match self.promote(item).await {
                Ok(true) => report.promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(track_id = %item.track_id, error = %e, "Failed to promote item");
                    report.failed += 1;
                }
            }
        }

        metrics::record_dispatch_run(report.queued, started.elapsed().as_secs_f64());
        if report.promoted > 0 || report.failed > 0 {
            info!(
                promoted = report.promoted,
                failed = report.failed,
                queued = report.queued,
                groups = report.groups,
                safe_mode,
                "Dispatch run complete"
            );
        }
        Ok(Some(report))
    }

    /// Mark the track processing and hand it to the broker. Returns false if
    /// the track left `queued` since the items were loaded.
    async fn promote(&self, item: &WorkItem) -> SchedulerResult<bool> {
        if !self
            .tracks
            .transition(&item.track_id, TrackStatus::Queued, TrackStatus::Processing)
            .await?
        {
            debug!(track_id = %item.track_id, "Track no longer queued");
            return Ok(false);
        }

        let job = DownloadJob::new(
            item.track_id.clone(),
            item.session_token.clone(),
            item.group_id.clone(),
            item.source.clone(),
            item.formats.clone(),
        );
        match self.broker.enqueue(&job, job.priority(), self.policy).await {
            Ok(()) => {
                debug!(
                    track_id = %item.track_id,
                    job_id = %job.job_id,
                    group = %item.group_key(),
                    priority = job.priority().value(),
                    "Promoted item"
                );
                metrics::record_promotion(item.group_id.is_some());
                Ok(true)
            }
            Err(e) => {
                metrics::record_enqueue_failure();
                if let Err(revert) = self
                    .tracks
                    .transition(&item.track_id, TrackStatus::Processing, TrackStatus::Queued)
                    .await
                {
                    error!(
                        track_id = %item.track_id,
                        error = %revert,
                        "Failed to revert track to queued"
                    );
                }
                Err(e.into())
            }
        }
    }
}

async fn next_trigger(triggers: &mut Option<TriggerStream>) -> Option<DispatchReason> {
    match triggers {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug)]
struct Plan<'a> {
    queued: usize,
    groups: usize,
    candidates: Vec<&'a WorkItem>,
}

/// Pick the head of every eligible group.
///
/// `items` must be oldest first. A group is eligible while it has fewer than
/// `group_cap` processing items, is not paused, and, in safe mode, is not a
/// multi-item group. A track referenced from several groups is promoted once.
fn plan_promotions(items: &[WorkItem], safe_mode: bool, group_cap: usize) -> Plan<'_> {
    let mut processing: HashMap<GroupKey, usize> = HashMap::new();
    let mut queues: BTreeMap<GroupKey, Vec<&WorkItem>> = BTreeMap::new();

    for item in items {
        match item.status {
            TrackStatus::Processing => *processing.entry(item.group_key()).or_default() += 1,
            TrackStatus::Queued => {
                if item.group_paused || (safe_mode && item.in_multi_item_group()) {
                    continue;
                }
                queues.entry(item.group_key()).or_default().push(item);
            }
            _ => {}
        }
    }

    let queued = queues.values().map(Vec::len).sum();
    let groups = queues.len();

    let mut heads: Vec<&WorkItem> = queues
        .into_iter()
        .filter(|(key, _)| processing.get(key).copied().unwrap_or(0) < group_cap)
        .filter_map(|(_, queue)| queue.first().copied())
        .collect();
    heads.sort_by_key(|item| item.created_at);

    let mut seen = HashSet::new();
    heads.retain(|item| seen.insert(item.track_id.clone()));

    Plan {
        queued,
        groups,
        candidates: heads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use soundry_models::{
        AudioFormat, GroupId, ItemSource, JobPriority, ProviderRef, SessionGroup, SessionItem,
        Track, TrackId,
    };
    use soundry_queue::{LocalSafeMode, QueueError, QueueResult};
    use soundry_store::Database;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingBroker {
        jobs: Mutex<Vec<(DownloadJob, JobPriority)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl JobBroker for RecordingBroker {
        async fn enqueue(
            &self,
            job: &DownloadJob,
            priority: JobPriority,
            _policy: RetryPolicy,
        ) -> QueueResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueueError::connection_failed("broker unavailable"));
            }
            self.jobs.lock().push((job.clone(), priority));
            Ok(())
        }
    }

    struct Setup {
        db: Database,
        broker: Arc<RecordingBroker>,
        safe_mode: Arc<LocalSafeMode>,
        dispatcher: Dispatcher,
    }

    async fn setup() -> Setup {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(RecordingBroker::default());
        let safe_mode = Arc::new(LocalSafeMode::default());
        let dispatcher =
            Dispatcher::new(db.tracks(), db.sessions(), broker.clone(), safe_mode.clone(), 1);
        Setup {
            db,
            broker,
            safe_mode,
            dispatcher,
        }
    }

    impl Setup {
        async fn group(&self, session: &str, size: u32) -> GroupId {
            let group = SessionGroup::new(session, "Mix", size, Utc::now());
            self.db.sessions().create_group(&group).await.unwrap();
            group.id
        }

        /// Queue `count` tracks for `session`, each a minute apart.
        async fn queue(
            &self,
            session: &str,
            group: Option<&GroupId>,
            count: usize,
        ) -> Vec<TrackId> {
            let base = Utc::now() - ChronoDuration::hours(1);
            let mut ids = Vec::new();
            for n in 0..count {
                let at = base + ChronoDuration::minutes(n as i64);
                let source = ProviderRef::youtube(format!("{session}-{n}"));
                let track = Track::queued(source, vec![AudioFormat::Mp3], at);
                self.db.tracks().create_track(&track).await.unwrap();
                let item = SessionItem::new(
                    session,
                    track.id.clone(),
                    group.cloned(),
                    ItemSource::Requested,
                    at,
                );
                self.db.sessions().create_item(&item).await.unwrap();
                ids.push(track.id);
            }
            ids
        }

        async fn status(&self, id: &TrackId) -> TrackStatus {
            self.db.tracks().track_status(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_one_promotion_per_group() {
        let s = setup().await;
        let mut heads = Vec::new();
        for session in ["alice", "bob", "carol"] {
            let group = s.group(session, 5).await;
            let ids = s.queue(session, Some(&group), 5).await;
            heads.push(ids[0].clone());
        }

        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 3);
        assert_eq!(report.groups, 3);
        assert_eq!(report.queued, 15);

        let jobs = s.broker.jobs.lock().clone();
        assert_eq!(jobs.len(), 3);
        for head in &heads {
            assert!(jobs.iter().any(|(job, _)| &job.track_id == head));
            assert_eq!(s.status(head).await, TrackStatus::Processing);
        }
        assert!(jobs.iter().all(|(_, priority)| *priority == JobPriority::Grouped));

        // Every group is now at its cap.
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 0);
    }

    #[tokio::test]
    async fn test_next_item_follows_completion() {
        let s = setup().await;
        let ids = s.queue("alice", None, 2).await;

        s.dispatcher.run_once().await.unwrap();
        assert_eq!(s.status(&ids[0]).await, TrackStatus::Processing);
        assert_eq!(s.status(&ids[1]).await, TrackStatus::Queued);

        s.db.tracks().fail_track(&ids[0], "boom").await.unwrap();
        s.dispatcher.run_once().await.unwrap();
        assert_eq!(s.status(&ids[1]).await, TrackStatus::Processing);

        let jobs = s.broker.jobs.lock().clone();
        assert_eq!(jobs[1].1, JobPriority::Single);
        assert_eq!(jobs[1].0.url, "https://www.youtube.com/watch?v=alice-1");
    }

    #[tokio::test]
    async fn test_safe_mode_holds_back_playlists() {
        let s = setup().await;
        let playlist = s.group("alice", 3).await;
        s.queue("alice", Some(&playlist), 3).await;
        let single = s.queue("bob", None, 1).await;

        s.safe_mode.set().await.unwrap();
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(s.broker.jobs.lock()[0].0.track_id, single[0]);

        s.safe_mode.clear().await.unwrap();
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
    }

    #[tokio::test]
    async fn test_single_item_group_runs_in_safe_mode() {
        let s = setup().await;
        let group = s.group("alice", 1).await;
        s.queue("alice", Some(&group), 1).await;

        s.safe_mode.set().await.unwrap();
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
    }

    #[tokio::test]
    async fn test_paused_group_is_skipped() {
        let s = setup().await;
        let group = s.group("alice", 2).await;
        let ids = s.queue("alice", Some(&group), 2).await;
        s.db.sessions().set_group_paused(&group, true).await.unwrap();

        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 0);
        assert_eq!(s.status(&ids[0]).await, TrackStatus::Queued);

        s.db.sessions().set_group_paused(&group, false).await.unwrap();
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_reverts_to_queued() {
        let s = setup().await;
        let ids = s.queue("alice", None, 1).await;

        s.broker.fail.store(true, Ordering::SeqCst);
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(s.status(&ids[0]).await, TrackStatus::Queued);

        s.broker.fail.store(false, Ordering::SeqCst);
        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(s.status(&ids[0]).await, TrackStatus::Processing);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let s = setup().await;
        s.dispatcher.running.store(true, Ordering::SeqCst);
        assert!(s.dispatcher.run_once().await.unwrap().is_none());

        s.dispatcher.running.store(false, Ordering::SeqCst);
        assert!(s.dispatcher.run_once().await.unwrap().is_some());
        assert!(!s.dispatcher.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shared_track_is_promoted_once() {
        let s = setup().await;
        let ids = s.queue("alice", None, 1).await;
        let item = SessionItem::new("bob", ids[0].clone(), None, ItemSource::Requested, Utc::now());
        s.db.sessions().create_item(&item).await.unwrap();

        let report = s.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(s.broker.jobs.lock().len(), 1);
    }
}
