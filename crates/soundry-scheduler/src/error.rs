//! Scheduler error types.

use soundry_media::MediaError;
use soundry_models::ModelError;
use soundry_queue::QueueError;
use soundry_storage::StorageError;
use soundry_store::StoreError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Errors of the periodic dispatcher and cleanup runs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors returned to the caller of a submission or session operation.
/// Nothing is persisted when one of these is returned from `submit`.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Session token is required")]
    MissingSession,

    #[error(transparent)]
    InvalidSource(#[from] ModelError),

    #[error("Playlist is empty: {0}")]
    EmptyPlaylist(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Could not expand playlist: {0}")]
    Expansion(#[from] MediaError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// The request itself was bad, as opposed to a backend failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AdmissionError::MissingSession
                | AdmissionError::InvalidSource(_)
                | AdmissionError::EmptyPlaylist(_)
                | AdmissionError::NotFound { .. }
        )
    }
}
