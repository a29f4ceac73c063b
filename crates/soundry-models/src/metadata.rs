//! Metadata returned by platform clients.

use serde::{Deserialize, Serialize};

use crate::provider::ProviderRef;

/// Descriptive metadata for a single track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub duration_secs: Option<u32>,
    pub external_id: String,
}

/// One entry of an expanded playlist or album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub source: ProviderRef,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
}

/// A multi-track source after expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}
