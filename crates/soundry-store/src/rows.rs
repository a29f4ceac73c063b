//! Raw database rows and their conversion into domain types.

use soundry_models::{
    AudioFormat, GroupId, ItemSource, ProviderRef, SessionGroup, SessionItem, SessionItemId,
    Track, TrackFile, TrackId,
};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};
use crate::time::{from_ms, opt_from_ms};

pub(crate) const TRACK_COLUMNS: &str = "id, provider_type, provider_id, title, artist, \
     duration_secs, status, formats, error, created_at, completed_at, expires_at";

#[derive(Debug, FromRow)]
pub(crate) struct TrackRow {
    pub id: String,
    pub provider_type: String,
    pub provider_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<i64>,
    pub status: String,
    pub formats: String,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl TryFrom<TrackRow> for Track {
    type Error = StoreError;

    fn try_from(row: TrackRow) -> StoreResult<Self> {
        let provider = row
            .provider_type
            .parse()
            .map_err(|e| StoreError::corrupt("tracks", e))?;
        Ok(Track {
            id: TrackId(row.id),
            source: ProviderRef::new(provider, row.provider_id),
            title: row.title,
            artist: row.artist,
            duration_secs: row.duration_secs.and_then(|d| u32::try_from(d).ok()),
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::corrupt("tracks", e))?,
            formats: AudioFormat::parse_list(&row.formats)
                .map_err(|e| StoreError::corrupt("tracks", e))?,
            created_at: from_ms(row.created_at),
            completed_at: opt_from_ms(row.completed_at),
            expires_at: opt_from_ms(row.expires_at),
            error: row.error,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FileRow {
    pub format: String,
    pub path: String,
    pub size_bytes: i64,
}

impl TryFrom<FileRow> for TrackFile {
    type Error = StoreError;

    fn try_from(row: FileRow) -> StoreResult<Self> {
        Ok(TrackFile {
            format: row
                .format
                .parse()
                .map_err(|e| StoreError::corrupt("track_files", e))?,
            path: row.path,
            size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ItemRow {
    pub id: String,
    pub session_token: String,
    pub track_id: String,
    pub group_id: Option<String>,
    pub source: String,
    pub created_at: i64,
}

impl TryFrom<ItemRow> for SessionItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> StoreResult<Self> {
        let source: ItemSource = row
            .source
            .parse()
            .map_err(|e| StoreError::corrupt("session_items", e))?;
        Ok(SessionItem {
            id: SessionItemId(row.id),
            session_token: row.session_token,
            track_id: TrackId(row.track_id),
            group_id: row.group_id.map(GroupId),
            source,
            created_at: from_ms(row.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct GroupRow {
    pub id: String,
    pub session_token: String,
    pub title: String,
    pub total_tracks: i64,
    pub paused: bool,
    pub created_at: i64,
}

impl From<GroupRow> for SessionGroup {
    fn from(row: GroupRow) -> Self {
        SessionGroup {
            id: GroupId(row.id),
            session_token: row.session_token,
            title: row.title,
            total_tracks: u32::try_from(row.total_tracks).unwrap_or_default(),
            paused: row.paused,
            created_at: from_ms(row.created_at),
        }
    }
}
