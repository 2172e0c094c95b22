//! Plain file primitives over the shared lock directory

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::LockError;

/// Create-exclusive / read / delete over a shared path.
///
/// No server-side locking primitive is assumed; in particular there is no
/// atomic compare-and-delete.
#[async_trait]
pub trait LockStorage: Send + Sync {
    /// Create the lock for `dataset_id` with `contents`. Returns `false`
    /// without touching anything when a lock already exists.
    async fn create_exclusive(&self, dataset_id: &str, contents: &[u8]) -> Result<bool, LockError>;

    /// Current lock content, or `None` when no lock exists
    async fn read(&self, dataset_id: &str) -> Result<Option<Vec<u8>>, LockError>;

    /// Remove the lock. Returns `false` when it was already gone.
    async fn delete(&self, dataset_id: &str) -> Result<bool, LockError>;

    /// Human-readable location of the lock, for diagnostics
    fn location(&self, dataset_id: &str) -> String;
}

/// Lock files stored as `<root>/<dataset_id>.lock`
#[derive(Debug, Clone)]
pub struct FsLockStorage {
    root: PathBuf,
}

impl FsLockStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, dataset_id: &str) -> PathBuf {
        self.root.join(format!("{}.lock", dataset_id))
    }

    fn io_error(&self, dataset_id: &str, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path_for(dataset_id),
            source,
        }
    }
}

#[async_trait]
impl LockStorage for FsLockStorage {
    async fn create_exclusive(&self, dataset_id: &str, contents: &[u8]) -> Result<bool, LockError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.io_error(dataset_id, e))?;

        let path = self.path_for(dataset_id);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_error(dataset_id, e)),
        };

        let written = async {
            file.write_all(contents).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            // A half-written lock would block everyone until force-released
            let _ = tokio::fs::remove_file(&path).await;
            return Err(self.io_error(dataset_id, e));
        }
        Ok(true)
    }

    async fn read(&self, dataset_id: &str) -> Result<Option<Vec<u8>>, LockError> {
        match tokio::fs::read(self.path_for(dataset_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(dataset_id, e)),
        }
    }

    async fn delete(&self, dataset_id: &str) -> Result<bool, LockError> {
        match tokio::fs::remove_file(self.path_for(dataset_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(dataset_id, e)),
        }
    }

    fn location(&self, dataset_id: &str) -> String {
        self.path_for(dataset_id).display().to_string()
    }
}
