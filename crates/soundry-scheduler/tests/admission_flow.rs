//! Submissions flowing through the dispatcher into the in-memory broker.

use std::sync::Arc;

use async_trait::async_trait;
use soundry_media::{MediaResult, PlaylistSource};
use soundry_models::{
    Clock, JobPriority, Playlist, PlaylistEntry, ProviderRef, SourceUrl, SystemClock, TrackStatus,
};
use soundry_queue::{JobSource, LocalDispatch, LocalSafeMode, MemoryQueue};
use soundry_scheduler::{Admission, Dispatcher};
use soundry_store::Database;

struct Album(usize);

#[async_trait]
impl PlaylistSource for Album {
    async fn expand(&self, _source: &SourceUrl) -> MediaResult<Playlist> {
        Ok(Playlist {
            title: "Album".to_string(),
            entries: (0..self.0)
                .map(|n| PlaylistEntry {
                    source: ProviderRef::youtube(format!("album-track-{n}")),
                    title: Some(format!("Track {n}")),
                    artist: Some("Band".to_string()),
                    duration_secs: None,
                })
                .collect(),
        })
    }
}

#[tokio::test]
async fn test_single_track_is_not_starved_by_album() {
    let db = Database::in_memory().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = Arc::new(MemoryQueue::default());
    let admission = Admission::new(
        db.tracks(),
        db.sessions(),
        Arc::new(Album(10)),
        Arc::new(LocalDispatch::new()),
        clock,
    );
    let safe_mode = Arc::new(LocalSafeMode::default());
    let dispatcher = Dispatcher::new(db.tracks(), db.sessions(), queue.clone(), safe_mode, 1);

    let album = admission
        .submit("alice", "https://open.spotify.com/album/4aawyAB9vmqN3uQ7FjRGTy", &[])
        .await
        .unwrap();
    let single = admission
        .submit("bob", "https://youtu.be/dQw4w9WgXcQ", &[])
        .await
        .unwrap();
    assert_eq!(album.items.len(), 10);

    let report = dispatcher.run_once().await.unwrap().unwrap();
    assert_eq!(report.promoted, 2);
    assert_eq!(report.groups, 2);

    // Single-track work outranks playlist work in the broker.
    let first = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(first.job().track_id, single.items[0].track_id);
    assert_eq!(first.queued.priority, JobPriority::Single);
    let second = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(second.job().track_id, album.items[0].track_id);

    let status = db.tracks().track_status(&album.items[1].track_id).await.unwrap();
    assert_eq!(status, Some(TrackStatus::Queued));
}
