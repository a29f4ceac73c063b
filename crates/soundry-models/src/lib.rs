//! Shared data models for the Soundry backend.
//!
//! This crate provides Serde-serializable types for:
//! - Tracks, converted files and their lifecycle
//! - Session items and playlist groups
//! - Provider references and source URL parsing
//! - Download job payloads and retry policy
//! - A mockable wall clock

pub mod clock;
pub mod error;
pub mod job;
pub mod metadata;
pub mod provider;
pub mod session;
pub mod track;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ModelError, ModelResult};
pub use job::{Backoff, DownloadJob, JobId, JobPriority, RetryPolicy};
pub use metadata::{Playlist, PlaylistEntry, TrackMetadata};
pub use provider::{Provider, ProviderRef, SourceKind, SourceUrl};
pub use session::{GroupId, GroupKey, ItemSource, SessionGroup, SessionItem, SessionItemId};
pub use track::{AudioFormat, Track, TrackFile, TrackId, TrackStatus, ARTIFACT_TTL_HOURS};
