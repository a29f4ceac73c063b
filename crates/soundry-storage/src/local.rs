//! Local filesystem storage.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use soundry_models::{AudioFormat, TrackFile, TrackId};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Downloads root holding one directory per track.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reads `DOWNLOADS_DIR`, defaulting to `./downloads`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("DOWNLOADS_DIR").unwrap_or_else(|_| "./downloads".to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn track_dir(&self, track_id: &TrackId) -> PathBuf {
        self.root.join(track_id.as_str())
    }

    /// Create (if missing) and return the track's directory.
    pub async fn prepare_track_dir(&self, track_id: &TrackId) -> StorageResult<PathBuf> {
        let dir = self.track_dir(track_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Storage-relative path of a converted file.
    pub fn relative_path(track_id: &TrackId, format: AudioFormat) -> String {
        format!("{}/{}.{}", track_id, format.as_str(), format.extension())
    }

    /// Map a storage-relative path to an absolute one, refusing anything that
    /// escapes the root.
    pub fn resolve(&self, relative: &str) -> StorageResult<PathBuf> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(StorageError::invalid_key(relative));
        }
        Ok(self.root.join(path))
    }

    pub async fn file_size(&self, relative: &str) -> StorageResult<u64> {
        let path = self.resolve(relative)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(relative)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, relative: &str) -> StorageResult<bool> {
        let path = self.resolve(relative)?;
        Ok(tokio::fs::try_exists(path).await?)
    }

    /// Delete one file. Missing files are not an error.
    pub async fn delete_file(&self, relative: &str) -> StorageResult<bool> {
        let path = self.resolve(relative)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::DeleteFailed {
                path: relative.to_string(),
                source,
            }),
        }
    }

    /// Delete a track's files and then its directory.
    ///
    /// Every file is attempted; the first error is returned after the rest
    /// have been tried.
    pub async fn delete_track(&self, track_id: &TrackId, files: &[TrackFile]) -> StorageResult<()> {
        let mut first_error = None;
        for file in files {
            if let Err(e) = self.delete_file(&file.path).await {
                warn!(track_id = %track_id, path = %file.path, error = %e, "Failed to delete file");
                first_error.get_or_insert(e);
            }
        }

        let dir = self.track_dir(track_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(track_id = %track_id, "Removed track directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                first_error.get_or_insert(StorageError::DeleteFailed {
                    path: dir.display().to_string(),
                    source,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escape() {
        let storage = LocalStorage::new("/data");
        assert!(storage.resolve("abc/mp3.mp3").is_ok());
        assert!(storage.resolve("../etc/passwd").is_err());
        assert!(storage.resolve("/etc/passwd").is_err());
        assert!(storage.resolve("").is_err());
    }

    #[test]
    fn test_relative_path_layout() {
        let id = TrackId::from_string("t1");
        assert_eq!(LocalStorage::relative_path(&id, AudioFormat::Flac), "t1/flac.flac");
    }

    #[tokio::test]
    async fn test_delete_track_removes_files_and_dir() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let id = TrackId::new();
        let dir = storage.prepare_track_dir(&id).await.unwrap();

        let rel = LocalStorage::relative_path(&id, AudioFormat::Mp3);
        tokio::fs::write(storage.resolve(&rel).unwrap(), b"abc").await.unwrap();
        tokio::fs::write(dir.join("source.m4a"), b"raw").await.unwrap();
        assert_eq!(storage.file_size(&rel).await.unwrap(), 3);

        let files = vec![TrackFile {
            format: AudioFormat::Mp3,
            path: rel.clone(),
            size_bytes: 3,
        }];
        storage.delete_track(&id, &files).await.unwrap();
        assert!(!storage.exists(&rel).await.unwrap());
        assert!(!dir.exists());

        // Deleting again is a no-op.
        storage.delete_track(&id, &files).await.unwrap();
    }
}
