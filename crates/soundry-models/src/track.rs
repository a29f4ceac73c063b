//! Tracks and their converted artifacts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::provider::ProviderRef;

/// How long a completed track's artifacts stay available.
pub const ARTIFACT_TTL_HOURS: i64 = 24;

/// Unique identifier for a track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Track lifecycle status.
///
/// Transitions only move forward: `queued -> processing -> {completed, failed,
/// cancelled}`. A queued track may also be cancelled directly, and a
/// processing track whose broker submission failed is put back to queued by
/// the dispatcher before any worker has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Queued => "queued",
            TrackStatus::Processing => "processing",
            TrackStatus::Completed => "completed",
            TrackStatus::Failed => "failed",
            TrackStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackStatus::Completed | TrackStatus::Failed | TrackStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub fn can_transition_to(&self, next: TrackStatus) -> bool {
        use TrackStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TrackStatus::Queued),
            "processing" => Ok(TrackStatus::Processing),
            "completed" => Ok(TrackStatus::Completed),
            "failed" => Ok(TrackStatus::Failed),
            "cancelled" => Ok(TrackStatus::Cancelled),
            other => Err(ModelError::unknown("track status", other)),
        }
    }
}

/// Output audio formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Flac,
    Wav,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 3] = [AudioFormat::Mp3, AudioFormat::Flac, AudioFormat::Wav];

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Parse a comma separated list, dropping duplicates and keeping order.
    pub fn parse_list(s: &str) -> ModelResult<Vec<AudioFormat>> {
        let mut formats = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let format: AudioFormat = part.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }

    pub fn join(formats: &[AudioFormat]) -> String {
        formats
            .iter()
            .map(AudioFormat::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "flac" => Ok(AudioFormat::Flac),
            "wav" => Ok(AudioFormat::Wav),
            other => Err(ModelError::unknown("audio format", other)),
        }
    }
}

/// One converted artifact of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackFile {
    pub format: AudioFormat,
    /// Path relative to the downloads root.
    pub path: String,
    pub size_bytes: u64,
}

/// A requested piece of media and its conversion outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    /// Internal only, never serialized to clients.
    #[serde(skip_serializing)]
    pub source: ProviderRef,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<u32>,
    pub status: TrackStatus,
    pub formats: Vec<AudioFormat>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Track {
    /// A freshly admitted track.
    pub fn queued(source: ProviderRef, formats: Vec<AudioFormat>, now: DateTime<Utc>) -> Self {
        let formats = if formats.is_empty() {
            vec![AudioFormat::default()]
        } else {
            formats
        };
        Self {
            id: TrackId::new(),
            source,
            title: None,
            artist: None,
            duration_secs: None,
            status: TrackStatus::Queued,
            formats,
            created_at: now,
            completed_at: None,
            expires_at: None,
            error: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>, artist: Option<String>) -> Self {
        self.title = title;
        self.artist = artist;
        self
    }

    /// Expiry for a track completed at `completed_at`.
    pub fn expiry_for(completed_at: DateTime<Utc>) -> DateTime<Utc> {
        completed_at + Duration::hours(ARTIFACT_TTL_HOURS)
    }

    /// Completed and still within its artifact lifetime.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == TrackStatus::Completed && self.expires_at.is_some_and(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use TrackStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Processing));
    }

    #[test]
    fn test_format_list_parsing() {
        let formats = AudioFormat::parse_list("mp3, FLAC,mp3,,wav").unwrap();
        assert_eq!(formats, vec![AudioFormat::Mp3, AudioFormat::Flac, AudioFormat::Wav]);
        assert_eq!(AudioFormat::join(&formats), "mp3,flac,wav");
        assert!(AudioFormat::parse_list("ogg").is_err());
    }

    #[test]
    fn test_queued_track_defaults_to_mp3() {
        let now = Utc::now();
        let track = Track::queued(ProviderRef::new(Provider::Youtube, "dQw4w9WgXcQ"), vec![], now);
        assert_eq!(track.status, TrackStatus::Queued);
        assert_eq!(track.formats, vec![AudioFormat::Mp3]);
        assert!(track.expires_at.is_none());
        assert!(!track.is_available(now));
    }

    #[test]
    fn test_source_not_serialized() {
        let track = Track::queued(ProviderRef::youtube("dQw4w9WgXcQ"), vec![], Utc::now());
        let json = serde_json::to_value(&track).unwrap();
        assert!(json.get("source").is_none());
        assert_eq!(json["status"], "queued");
    }
}
