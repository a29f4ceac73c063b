//! Artifact storage on the local filesystem.
//!
//! Converted files live under `<root>/<track_id>/<format>.<ext>`. Paths stored
//! in the database are relative to the root.

pub mod error;
pub mod local;

pub use error::{StorageError, StorageResult};
pub use local::LocalStorage;
