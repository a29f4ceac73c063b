//! Session item and group repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use soundry_models::{
    AudioFormat, GroupId, GroupKey, ProviderRef, SessionGroup, SessionItem, SessionItemId,
    TrackId, TrackStatus,
};
use sqlx::{FromRow, SqlitePool};

use crate::error::{StoreError, StoreResult};
use crate::rows::{GroupRow, ItemRow};
use crate::time::{from_ms, to_ms};

/// A session item whose track is waiting for or undergoing processing,
/// joined with what the dispatcher needs to schedule it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub item_id: SessionItemId,
    pub track_id: TrackId,
    pub session_token: String,
    pub group_id: Option<GroupId>,
    pub group_paused: bool,
    pub group_size: Option<u32>,
    pub status: TrackStatus,
    pub source: ProviderRef,
    pub formats: Vec<AudioFormat>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::for_item(self.group_id.as_ref(), &self.session_token)
    }

    pub fn in_multi_item_group(&self) -> bool {
        self.group_size.is_some_and(|n| n > 1)
    }
}

/// Outcome of removing a session item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedItem {
    pub track_id: TrackId,
    /// The item was the track's last reference and the track was cancelled.
    pub track_cancelled: bool,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_group(&self, group: &SessionGroup) -> StoreResult<()>;
    async fn get_group(&self, id: &GroupId) -> StoreResult<Option<SessionGroup>>;
    async fn set_group_paused(&self, id: &GroupId, paused: bool) -> StoreResult<bool>;

    /// Insert unless the session already references the track. Returns true if inserted.
    async fn create_item(&self, item: &SessionItem) -> StoreResult<bool>;
    async fn get_item(&self, id: &SessionItemId) -> StoreResult<Option<SessionItem>>;
    async fn items_for_track(&self, track_id: &TrackId) -> StoreResult<Vec<SessionItem>>;
    async fn items_for_session(&self, session_token: &str) -> StoreResult<Vec<SessionItem>>;

    /// Delete an item; cancel its track when no references remain and the
    /// track has not reached a terminal status.
    async fn remove_item(&self, id: &SessionItemId) -> StoreResult<Option<RemovedItem>>;

    /// Items whose track is queued or processing, oldest first.
    async fn list_work_items(&self) -> StoreResult<Vec<WorkItem>>;
}

pub struct SqlxSessionRepository {
    pool: SqlitePool,
}

impl SqlxSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct WorkRow {
    item_id: String,
    track_id: String,
    session_token: String,
    group_id: Option<String>,
    group_paused: Option<bool>,
    group_size: Option<i64>,
    status: String,
    provider_type: String,
    provider_id: String,
    formats: String,
    created_at: i64,
}

impl TryFrom<WorkRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkRow) -> StoreResult<Self> {
        let corrupt = |e: soundry_models::ModelError| StoreError::corrupt("session_items", e);
        Ok(WorkItem {
            item_id: SessionItemId(row.item_id),
            track_id: TrackId(row.track_id),
            session_token: row.session_token,
            group_id: row.group_id.map(GroupId),
            group_paused: row.group_paused.unwrap_or(false),
            group_size: row.group_size.and_then(|n| u32::try_from(n).ok()),
            status: row.status.parse().map_err(corrupt)?,
            source: ProviderRef::new(row.provider_type.parse().map_err(corrupt)?, row.provider_id),
            formats: AudioFormat::parse_list(&row.formats).map_err(corrupt)?,
            created_at: from_ms(row.created_at),
        })
    }
}

const ITEM_COLUMNS: &str = "id, session_token, track_id, group_id, source, created_at";

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn create_group(&self, group: &SessionGroup) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_groups (id, session_token, title, total_tracks, paused, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group.id.as_str())
        .bind(&group.session_token)
        .bind(&group.title)
        .bind(i64::from(group.total_tracks))
        .bind(group.paused)
        .bind(to_ms(group.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_group(&self, id: &GroupId) -> StoreResult<Option<SessionGroup>> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, session_token, title, total_tracks, paused, created_at \
             FROM session_groups WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SessionGroup::from))
    }

    async fn set_group_paused(&self, id: &GroupId, paused: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE session_groups SET paused = ? WHERE id = ?")
            .bind(paused)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_item(&self, item: &SessionItem) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO session_items (id, session_token, track_id, group_id, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_token, track_id) DO NOTHING
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.session_token)
        .bind(item.track_id.as_str())
        .bind(item.group_id.as_ref().map(GroupId::as_str))
        .bind(item.source.as_str())
        .bind(to_ms(item.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_item(&self, id: &SessionItemId) -> StoreResult<Option<SessionItem>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM session_items WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionItem::try_from).transpose()
    }

    async fn items_for_track(&self, track_id: &TrackId) -> StoreResult<Vec<SessionItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM session_items WHERE track_id = ? ORDER BY created_at"
        ))
        .bind(track_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionItem::try_from).collect()
    }

    async fn items_for_session(&self, session_token: &str) -> StoreResult<Vec<SessionItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM session_items \
             WHERE session_token = ? ORDER BY created_at DESC"
        ))
        .bind(session_token)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionItem::try_from).collect()
    }

    async fn remove_item(&self, id: &SessionItemId) -> StoreResult<Option<RemovedItem>> {
        let mut tx = self.pool.begin().await?;

        let track_id: Option<String> =
            sqlx::query_scalar("DELETE FROM session_items WHERE id = ? RETURNING track_id")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(track_id) = track_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let cancelled = sqlx::query(
            r#"
            UPDATE tracks SET status = 'cancelled'
            WHERE id = ?
              AND status IN ('queued', 'processing')
              AND NOT EXISTS (SELECT 1 FROM session_items WHERE track_id = ?)
            "#,
        )
        .bind(&track_id)
        .bind(&track_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(Some(RemovedItem {
            track_id: TrackId(track_id),
            track_cancelled: cancelled == 1,
        }))
    }

    async fn list_work_items(&self) -> StoreResult<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkRow>(
            r#"
            SELECT si.id AS item_id, si.track_id, si.session_token, si.group_id,
                   g.paused AS group_paused, g.total_tracks AS group_size,
                   t.status, t.provider_type, t.provider_id, t.formats, si.created_at
            FROM session_items si
            JOIN tracks t ON t.id = si.track_id
            LEFT JOIN session_groups g ON g.id = si.group_id
            WHERE t.status IN ('queued', 'processing')
            ORDER BY si.created_at ASC, si.rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkItem::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use soundry_models::{ItemSource, Track};

    #[tokio::test]
    async fn test_create_item_is_idempotent_per_session() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let track = Track::queued(ProviderRef::youtube("dQw4w9WgXcQ"), vec![], now);
        db.tracks().create_track(&track).await.unwrap();

        let sessions = db.sessions();
        let first = SessionItem::new("s", track.id.clone(), None, ItemSource::Requested, now);
        let again = SessionItem::new("s", track.id.clone(), None, ItemSource::Downloaded, now);
        assert!(sessions.create_item(&first).await.unwrap());
        assert!(!sessions.create_item(&again).await.unwrap());
        assert_eq!(sessions.items_for_session("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_removing_last_item_cancels_track() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let track = Track::queued(ProviderRef::youtube("dQw4w9WgXcQ"), vec![], now);
        db.tracks().create_track(&track).await.unwrap();

        let sessions = db.sessions();
        let a = SessionItem::new("a", track.id.clone(), None, ItemSource::Requested, now);
        let b = SessionItem::new("b", track.id.clone(), None, ItemSource::Requested, now);
        sessions.create_item(&a).await.unwrap();
        sessions.create_item(&b).await.unwrap();

        let removed = sessions.remove_item(&a.id).await.unwrap().unwrap();
        assert!(!removed.track_cancelled);

        let removed = sessions.remove_item(&b.id).await.unwrap().unwrap();
        assert!(removed.track_cancelled);
        assert_eq!(
            db.tracks().track_status(&track.id).await.unwrap(),
            Some(TrackStatus::Cancelled)
        );
        assert!(sessions.remove_item(&b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removing_item_of_completed_track_keeps_it() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let mut track = Track::queued(ProviderRef::youtube("dQw4w9WgXcQ"), vec![], now);
        track.status = TrackStatus::Completed;
        db.tracks().create_track(&track).await.unwrap();

        let sessions = db.sessions();
        let item = SessionItem::new("a", track.id.clone(), None, ItemSource::Requested, now);
        sessions.create_item(&item).await.unwrap();

        let removed = sessions.remove_item(&item.id).await.unwrap().unwrap();
        assert!(!removed.track_cancelled);
        assert_eq!(
            db.tracks().track_status(&track.id).await.unwrap(),
            Some(TrackStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_work_items_carry_group_state() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let sessions = db.sessions();
        let group = SessionGroup::new("s", "Mix", 2, now);
        sessions.create_group(&group).await.unwrap();
        sessions.set_group_paused(&group.id, true).await.unwrap();

        let grouped = Track::queued(ProviderRef::youtube("aaaaaaaaaaa"), vec![], now);
        let single = Track::queued(ProviderRef::youtube("bbbbbbbbbbb"), vec![], now);
        let mut done = Track::queued(ProviderRef::youtube("ccccccccccc"), vec![], now);
        done.status = TrackStatus::Failed;
        for t in [&grouped, &single, &done] {
            db.tracks().create_track(t).await.unwrap();
        }
        let grouped_item = SessionItem::new(
            "s",
            grouped.id.clone(),
            Some(group.id.clone()),
            ItemSource::Requested,
            now,
        );
        sessions.create_item(&grouped_item).await.unwrap();
        let single_item =
            SessionItem::new("s", single.id.clone(), None, ItemSource::Requested, now);
        sessions.create_item(&single_item).await.unwrap();
        sessions
            .create_item(&SessionItem::new("s", done.id.clone(), None, ItemSource::Requested, now))
            .await
            .unwrap();

        let items = sessions.list_work_items().await.unwrap();
        assert_eq!(items.len(), 2);
        let grouped_item = items.iter().find(|i| i.track_id == grouped.id).unwrap();
        assert!(grouped_item.group_paused);
        assert!(grouped_item.in_multi_item_group());
        let single_item = items.iter().find(|i| i.track_id == single.id).unwrap();
        assert_eq!(single_item.group_key(), GroupKey::Session("s".into()));
        assert!(!single_item.in_multi_item_group());
    }
}
