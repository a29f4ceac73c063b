//! Worker error types.

use std::time::Duration;

use soundry_media::{FailureClass, MediaError};
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No identity became available within {0:?}")]
    ResourceTimeout(Duration),

    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Identity {0} is not held")]
    IdentityNotHeld(String),

    #[error("Track is {duration_secs}s long, limit is {max_secs}s")]
    TrackTooLong { duration_secs: u32, max_secs: u32 },

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("Track was cancelled")]
    Cancelled,

    #[error("Job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("Reschedule: {reason}")]
    Reschedule { reason: String, delay: Duration },

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Store error: {0}")]
    Store(#[from] soundry_store::StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] soundry_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] soundry_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Put the job back without consuming an attempt.
    pub fn reschedule(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Reschedule {
            reason: reason.into(),
            delay,
        }
    }

    pub fn is_reschedule(&self) -> bool {
        matches!(self, WorkerError::Reschedule { .. })
    }

    /// Failures where another attempt cannot help.
    pub fn is_permanent_failure(&self) -> bool {
        match self {
            WorkerError::TrackTooLong { .. }
            | WorkerError::TrackNotFound(_)
            | WorkerError::Cancelled
            | WorkerError::ConfigError(_) => true,
            WorkerError::Media(e) => e.is_permanent() || is_unavailable_media(&e.to_string()),
            _ => false,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        !self.is_permanent_failure()
    }

    /// Identity and breaker classification of this failure.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            WorkerError::Media(e) => e.failure_class(),
            _ => FailureClass::Transient,
        }
    }
}

/// Upstream messages for media that no longer exists or never will.
fn is_unavailable_media(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("private video")
        || msg.contains("video unavailable")
        || msg.contains("video is unavailable")
        || msg.contains("has been removed")
        || msg.contains("not available in your country")
        || (msg.contains("copyright") && msg.contains("block"))
}
