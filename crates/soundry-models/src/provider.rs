//! Media providers and source URL parsing.
//!
//! A track's origin is stored as a two-field [`ProviderRef`] (platform plus
//! external id). External ids may contain any character, including `:` and
//! `/` (SoundCloud permalinks), so the pair is never flattened into one key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{ModelError, ModelResult};

/// Supported media platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Youtube,
    Soundcloud,
    Spotify,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Youtube => "youtube",
            Provider::Soundcloud => "soundcloud",
            Provider::Spotify => "spotify",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(Provider::Youtube),
            "soundcloud" => Ok(Provider::Soundcloud),
            "spotify" => Ok(Provider::Spotify),
            other => Err(ModelError::unknown("provider", other)),
        }
    }
}

/// Internal descriptor of where a track comes from. Never exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderRef {
    pub provider: Provider,
    pub external_id: String,
}

impl ProviderRef {
    pub fn new(provider: Provider, external_id: impl Into<String>) -> Self {
        Self {
            provider,
            external_id: external_id.into(),
        }
    }

    pub fn youtube(video_id: impl Into<String>) -> Self {
        Self::new(Provider::Youtube, video_id)
    }

    /// Rebuild the public URL the platform clients understand.
    pub fn canonical_url(&self) -> String {
        match self.provider {
            Provider::Youtube => format!("https://www.youtube.com/watch?v={}", self.external_id),
            Provider::Spotify => format!("https://open.spotify.com/track/{}", self.external_id),
            Provider::Soundcloud => format!("https://soundcloud.com/{}", self.external_id),
        }
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.provider, self.external_id)
    }
}

/// What a submitted URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Track,
    Playlist,
    Album,
}

/// A validated, classified submission URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    pub provider: Provider,
    pub kind: SourceKind,
    pub id: String,
    pub url: String,
}

impl SourceUrl {
    /// Parse and classify a user-supplied URL.
    ///
    /// Accepts YouTube (watch, youtu.be, shorts, embed, live, music, playlist),
    /// SoundCloud (tracks and `/sets/`) and Spotify (track, playlist, album,
    /// including `spotify:` URIs).
    pub fn parse(input: &str) -> ModelResult<Self> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("spotify:") {
            return parse_spotify_uri(input, rest);
        }

        let url = Url::parse(input).map_err(|_| ModelError::InvalidUrl(input.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ModelError::InvalidUrl(input.to_string()));
        }
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
            .ok_or_else(|| ModelError::InvalidUrl(input.to_string()))?;

        match host.as_str() {
            "youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtu.be" => {
                parse_youtube(&url, &host)
            }
            "soundcloud.com" | "m.soundcloud.com" => parse_soundcloud(&url),
            "open.spotify.com" => parse_spotify(&url),
            _ => Err(ModelError::UnsupportedProvider(input.to_string())),
        }
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self.kind, SourceKind::Track)
    }

    /// Provider reference for single-track URLs.
    pub fn track_ref(&self) -> Option<ProviderRef> {
        match self.kind {
            SourceKind::Track => Some(ProviderRef::new(self.provider, self.id.clone())),
            _ => None,
        }
    }
}

fn parse_youtube(url: &Url, host: &str) -> ModelResult<SourceUrl> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let query = |key: &str| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    };

    let video_id = if host == "youtu.be" {
        segments.first().map(|s| s.to_string())
    } else {
        match segments.as_slice() {
            ["watch"] => query("v"),
            ["shorts" | "embed" | "live" | "v", id, ..] => Some(id.to_string()),
            _ => None,
        }
    };

    if let Some(id) = video_id {
        if !is_valid_youtube_id(&id) {
            return Err(ModelError::InvalidId {
                provider: "youtube",
                id,
            });
        }
        return Ok(SourceUrl {
            provider: Provider::Youtube,
            kind: SourceKind::Track,
            url: format!("https://www.youtube.com/watch?v={id}"),
            id,
        });
    }

    match (segments.as_slice(), query("list")) {
        (["playlist"], Some(list)) if !list.is_empty() => Ok(SourceUrl {
            provider: Provider::Youtube,
            kind: SourceKind::Playlist,
            url: format!("https://www.youtube.com/playlist?list={list}"),
            id: list,
        }),
        _ => Err(ModelError::UnsupportedProvider(url.to_string())),
    }
}

fn parse_soundcloud(url: &Url) -> ModelResult<SourceUrl> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let (kind, id) = match segments.as_slice() {
        [user, "sets", set, ..] => (SourceKind::Playlist, format!("{user}/sets/{set}")),
        [user, track] => (SourceKind::Track, format!("{user}/{track}")),
        _ => return Err(ModelError::UnsupportedProvider(url.to_string())),
    };

    Ok(SourceUrl {
        provider: Provider::Soundcloud,
        kind,
        url: format!("https://soundcloud.com/{id}"),
        id,
    })
}

fn parse_spotify(url: &Url) -> ModelResult<SourceUrl> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    // Localised links carry an `intl-xx` prefix segment.
    let position = segments
        .iter()
        .position(|s| matches!(*s, "track" | "playlist" | "album"))
        .ok_or_else(|| ModelError::UnsupportedProvider(url.to_string()))?;
    let id = segments
        .get(position + 1)
        .ok_or_else(|| ModelError::UnsupportedProvider(url.to_string()))?;

    spotify_source(segments[position], id)
}

fn parse_spotify_uri(input: &str, rest: &str) -> ModelResult<SourceUrl> {
    match rest.split_once(':') {
        Some((kind, id)) => spotify_source(kind, id),
        None => Err(ModelError::InvalidUrl(input.to_string())),
    }
}

fn spotify_source(kind: &str, id: &str) -> ModelResult<SourceUrl> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ModelError::InvalidId {
            provider: "spotify",
            id: id.to_string(),
        });
    }
    let kind = match kind {
        "track" => SourceKind::Track,
        "playlist" => SourceKind::Playlist,
        "album" => SourceKind::Album,
        other => return Err(ModelError::unknown("spotify resource", other)),
    };
    let path = match kind {
        SourceKind::Track => "track",
        SourceKind::Playlist => "playlist",
        SourceKind::Album => "album",
    };

    Ok(SourceUrl {
        provider: Provider::Spotify,
        kind,
        url: format!("https://open.spotify.com/{path}/{id}"),
        id: id.to_string(),
    })
}

/// YouTube ids are 11 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_youtube_id(id: &str) -> bool {
    id.len() == 11
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
