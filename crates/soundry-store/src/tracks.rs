//! Track repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use soundry_models::{
    AudioFormat, ProviderRef, Track, TrackFile, TrackId, TrackMetadata, TrackStatus,
};
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::rows::{FileRow, TrackRow, TRACK_COLUMNS};
use crate::time::to_ms;

/// Track persistence operations.
#[async_trait]
pub trait TrackRepository: Send + Sync {
    async fn create_track(&self, track: &Track) -> StoreResult<()>;
    async fn get_track(&self, id: &TrackId) -> StoreResult<Option<Track>>;
    async fn track_status(&self, id: &TrackId) -> StoreResult<Option<TrackStatus>>;

    /// A completed track for `source` whose artifacts have not expired.
    async fn find_available(
        &self,
        source: &ProviderRef,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Track>>;

    /// Compare-and-swap the status. Returns false if the track was not in `from`.
    async fn transition(
        &self,
        id: &TrackId,
        from: TrackStatus,
        to: TrackStatus,
    ) -> StoreResult<bool>;

    async fn update_metadata(&self, id: &TrackId, metadata: &TrackMetadata) -> StoreResult<()>;

    /// Remember the last error without changing status.
    async fn record_error(&self, id: &TrackId, message: &str) -> StoreResult<()>;

    /// processing -> failed with the captured error.
    async fn fail_track(&self, id: &TrackId, message: &str) -> StoreResult<bool>;

    /// processing -> completed, attaching `files` in the same transaction.
    /// Returns false if the track was no longer processing.
    async fn complete_track(
        &self,
        id: &TrackId,
        files: &[TrackFile],
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn files_for(&self, id: &TrackId) -> StoreResult<Vec<TrackFile>>;
    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<TrackId>>;
    async fn list_by_status(&self, status: TrackStatus) -> StoreResult<Vec<TrackId>>;
    async fn count_tracks(&self) -> StoreResult<u64>;
    async fn oldest_tracks(&self, limit: u64) -> StoreResult<Vec<TrackId>>;

    /// Delete the row; files and session items cascade.
    async fn delete_track(&self, id: &TrackId) -> StoreResult<bool>;

    /// Create-if-absent claim on the download of `source`. A claim older than
    /// `stale_before`, or held by a track that is no longer processing, is taken over.
    async fn claim_provider(
        &self,
        source: &ProviderRef,
        track_id: &TrackId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn claim_holder(&self, source: &ProviderRef) -> StoreResult<Option<TrackId>>;
    async fn release_claim(&self, source: &ProviderRef, track_id: &TrackId) -> StoreResult<()>;

    /// Re-point the session items of `placeholder` at `existing` and delete the
    /// placeholder. Items that would duplicate an existing link are dropped.
    async fn merge_into(&self, placeholder: &TrackId, existing: &TrackId) -> StoreResult<u64>;
}

/// SQLx implementation of [`TrackRepository`].
pub struct SqlxTrackRepository {
    pool: SqlitePool,
}

impl SqlxTrackRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackRepository for SqlxTrackRepository {
    async fn create_track(&self, track: &Track) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tracks (id, provider_type, provider_id, title, artist, duration_secs,
                                status, formats, error, created_at, completed_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(track.id.as_str())
        .bind(track.source.provider.as_str())
        .bind(&track.source.external_id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(track.duration_secs.map(i64::from))
        .bind(track.status.as_str())
        .bind(AudioFormat::join(&track.formats))
        .bind(&track.error)
        .bind(to_ms(track.created_at))
        .bind(track.completed_at.map(to_ms))
        .bind(track.expires_at.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_track(&self, id: &TrackId) -> StoreResult<Option<Track>> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?");
        let row = sqlx::query_as::<_, TrackRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Track::try_from).transpose()
    }

    async fn track_status(&self, id: &TrackId) -> StoreResult<Option<TrackStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tracks WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        status
            .map(|s| s.parse().map_err(|e| StoreError::corrupt("tracks", e)))
            .transpose()
    }

    async fn find_available(
        &self,
        source: &ProviderRef,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Track>> {
        let row = sqlx::query_as::<_, TrackRow>(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks \
             WHERE provider_type = ? AND provider_id = ? \
               AND status = 'completed' AND expires_at > ? \
             ORDER BY expires_at DESC LIMIT 1"
        ))
        .bind(source.provider.as_str())
        .bind(&source.external_id)
        .bind(to_ms(now))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Track::try_from).transpose()
    }

    async fn transition(
        &self,
        id: &TrackId,
        from: TrackStatus,
        to: TrackStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE tracks SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id.as_str())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_metadata(&self, id: &TrackId, metadata: &TrackMetadata) -> StoreResult<()> {
        sqlx::query("UPDATE tracks SET title = ?, artist = ?, duration_secs = ? WHERE id = ?")
            .bind(&metadata.title)
            .bind(&metadata.artist)
            .bind(metadata.duration_secs.map(i64::from))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_error(&self, id: &TrackId, message: &str) -> StoreResult<()> {
        sqlx::query("UPDATE tracks SET error = ? WHERE id = ?")
            .bind(message)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_track(&self, id: &TrackId, message: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tracks SET status = 'failed', error = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(message)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_track(
        &self,
        id: &TrackId,
        files: &[TrackFile],
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if files.is_empty() {
            return Err(StoreError::InvalidState(format!(
                "track {id} cannot complete without files"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE tracks
            SET status = 'completed', completed_at = ?, expires_at = ?, error = NULL
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(to_ms(completed_at))
        .bind(to_ms(Track::expiry_for(completed_at)))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for file in files {
            sqlx::query(
                "INSERT OR REPLACE INTO track_files (track_id, format, path, size_bytes) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(file.format.as_str())
            .bind(&file.path)
            .bind(i64::try_from(file.size_bytes).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn files_for(&self, id: &TrackId) -> StoreResult<Vec<TrackFile>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT format, path, size_bytes FROM track_files WHERE track_id = ? ORDER BY format",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TrackFile::try_from).collect()
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<TrackId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM tracks \
             WHERE expires_at IS NOT NULL AND expires_at < ? ORDER BY expires_at",
        )
        .bind(to_ms(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(TrackId).collect())
    }

    async fn list_by_status(&self, status: TrackStatus) -> StoreResult<Vec<TrackId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM tracks WHERE status = ? ORDER BY created_at")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(TrackId).collect())
    }

    async fn count_tracks(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn oldest_tracks(&self, limit: u64) -> StoreResult<Vec<TrackId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM tracks ORDER BY created_at ASC, rowid ASC LIMIT ?")
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(TrackId).collect())
    }

    async fn delete_track(&self, id: &TrackId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM tracks WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_provider(
        &self,
        source: &ProviderRef,
        track_id: &TrackId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO provider_claims (provider_type, provider_id, track_id, claimed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (provider_type, provider_id) DO UPDATE SET
                track_id = excluded.track_id,
                claimed_at = excluded.claimed_at
            WHERE provider_claims.track_id = excluded.track_id
               OR provider_claims.claimed_at < ?
               OR NOT EXISTS (
                   SELECT 1 FROM tracks
                   WHERE tracks.id = provider_claims.track_id AND tracks.status = 'processing'
               )
            "#,
        )
        .bind(source.provider.as_str())
        .bind(&source.external_id)
        .bind(track_id.as_str())
        .bind(to_ms(now))
        .bind(to_ms(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_holder(&self, source: &ProviderRef) -> StoreResult<Option<TrackId>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT track_id FROM provider_claims WHERE provider_type = ? AND provider_id = ?",
        )
        .bind(source.provider.as_str())
        .bind(&source.external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(TrackId))
    }

    async fn release_claim(&self, source: &ProviderRef, track_id: &TrackId) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM provider_claims \
             WHERE provider_type = ? AND provider_id = ? AND track_id = ?",
        )
        .bind(source.provider.as_str())
        .bind(&source.external_id)
        .bind(track_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn merge_into(&self, placeholder: &TrackId, existing: &TrackId) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let moved =
            sqlx::query("UPDATE OR IGNORE session_items SET track_id = ? WHERE track_id = ?")
                .bind(existing.as_str())
                .bind(placeholder.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        sqlx::query("DELETE FROM tracks WHERE id = ?")
            .bind(placeholder.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Duration;
    use soundry_models::{ItemSource, Provider, SessionItem};

    fn mp3(track: &TrackId) -> Vec<TrackFile> {
        vec![TrackFile {
            format: AudioFormat::Mp3,
            path: format!("{track}/mp3.mp3"),
            size_bytes: 1024,
        }]
    }

    async fn processing_track(repo: &dyn TrackRepository, source: ProviderRef) -> Track {
        let track = Track::queued(source, vec![AudioFormat::Mp3], Utc::now());
        repo.create_track(&track).await.unwrap();
        assert!(repo
            .transition(&track.id, TrackStatus::Queued, TrackStatus::Processing)
            .await
            .unwrap());
        track
    }

    #[tokio::test]
    async fn test_complete_sets_expiry_and_files() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let track = processing_track(repo.as_ref(), ProviderRef::youtube("dQw4w9WgXcQ")).await;

        let now = Utc::now();
        assert!(repo.complete_track(&track.id, &mp3(&track.id), now).await.unwrap());

        let stored = repo.get_track(&track.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackStatus::Completed);
        assert_eq!(
            stored.expires_at.unwrap().timestamp_millis(),
            (now + Duration::hours(24)).timestamp_millis()
        );
        assert_eq!(repo.files_for(&track.id).await.unwrap().len(), 1);

        let found = repo.find_available(&track.source, now).await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(track.id.clone()));
        let later = now + Duration::hours(25);
        assert!(repo.find_available(&track.source, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_rejects_cancelled_track() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let track = processing_track(repo.as_ref(), ProviderRef::youtube("dQw4w9WgXcQ")).await;
        assert!(repo
            .transition(&track.id, TrackStatus::Processing, TrackStatus::Cancelled)
            .await
            .unwrap());

        assert!(!repo.complete_track(&track.id, &mp3(&track.id), Utc::now()).await.unwrap());
        assert!(repo.files_for(&track.id).await.unwrap().is_empty());
        assert!(repo.complete_track(&track.id, &[], Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let track = Track::queued(ProviderRef::youtube("dQw4w9WgXcQ"), vec![], Utc::now());
        repo.create_track(&track).await.unwrap();

        let (queued, processing) = (TrackStatus::Queued, TrackStatus::Processing);
        assert!(repo.transition(&track.id, queued, processing).await.unwrap());
        assert!(!repo.transition(&track.id, queued, processing).await.unwrap());
        assert!(repo.fail_track(&track.id, "boom").await.unwrap());
        assert!(!repo.fail_track(&track.id, "again").await.unwrap());
        assert_eq!(repo.track_status(&track.id).await.unwrap(), Some(TrackStatus::Failed));
    }

    #[tokio::test]
    async fn test_provider_claim_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let source = ProviderRef::new(Provider::Soundcloud, "artist:x/track");
        let first = processing_track(repo.as_ref(), source.clone()).await;
        let second = processing_track(repo.as_ref(), source.clone()).await;

        let now = Utc::now();
        let stale = now - Duration::minutes(30);
        assert!(repo.claim_provider(&source, &first.id, now, stale).await.unwrap());
        assert!(repo.claim_provider(&source, &first.id, now, stale).await.unwrap());
        assert!(!repo.claim_provider(&source, &second.id, now, stale).await.unwrap());
        assert_eq!(repo.claim_holder(&source).await.unwrap(), Some(first.id.clone()));

        // Holder failed: claim can be taken over.
        repo.fail_track(&first.id, "blocked").await.unwrap();
        assert!(repo.claim_provider(&source, &second.id, now, stale).await.unwrap());

        repo.release_claim(&source, &second.id).await.unwrap();
        assert!(repo.claim_holder(&source).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let source = ProviderRef::youtube("dQw4w9WgXcQ");
        let first = processing_track(repo.as_ref(), source.clone()).await;
        let second = processing_track(repo.as_ref(), source.clone()).await;

        let then = Utc::now() - Duration::hours(2);
        let stale = then - Duration::hours(1);
        assert!(repo.claim_provider(&source, &first.id, then, stale).await.unwrap());

        let now = Utc::now();
        let stale = now - Duration::hours(1);
        assert!(repo.claim_provider(&source, &second.id, now, stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_moves_items_and_drops_placeholder() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let sessions = db.sessions();
        let source = ProviderRef::youtube("dQw4w9WgXcQ");
        let existing = processing_track(repo.as_ref(), source.clone()).await;
        let placeholder = processing_track(repo.as_ref(), source).await;

        let now = Utc::now();
        let links = [("a", &existing.id), ("a", &placeholder.id), ("b", &placeholder.id)];
        for (session, track_id) in links {
            let item =
                SessionItem::new(session, track_id.clone(), None, ItemSource::Requested, now);
            sessions.create_item(&item).await.unwrap();
        }

        let moved = repo.merge_into(&placeholder.id, &existing.id).await.unwrap();
        assert_eq!(moved, 1);
        assert!(repo.get_track(&placeholder.id).await.unwrap().is_none());
        assert_eq!(sessions.items_for_track(&existing.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_oldest_tracks_by_creation() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tracks();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let track = Track::queued(
                ProviderRef::youtube(format!("video{i:06}")),
                vec![],
                base + Duration::seconds(i),
            );
            repo.create_track(&track).await.unwrap();
            ids.push(track.id);
        }
        assert_eq!(repo.count_tracks().await.unwrap(), 3);
        assert_eq!(repo.oldest_tracks(1).await.unwrap(), vec![ids[0].clone()]);
    }
}
