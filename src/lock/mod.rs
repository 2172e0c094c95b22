//! Advisory dataset locks over a shared filesystem
//!
//! The lock file is the only coordination medium. Acquisition is a single
//! bounded attempt: create the file exclusively, and if it already exists
//! only reclaim it when it is stale *and* its content is byte-identical on
//! two consecutive reads. This narrows, but does not close, the window in
//! which two clients reclaiming the same stale lock can race; the protocol
//! is best-effort, not linearizable. A legitimate holder whose operation
//! outlives its ttl can also be reclaimed, so the ttl must exceed the
//! slowest expected workflow.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Classified, ErrorKind};

pub mod file;
pub mod storage;

pub use file::{LockFile, LockOwner};
pub use storage::{FsLockStorage, LockStorage};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{}", held_message(.dataset_id, .holder.as_deref()))]
    Held {
        dataset_id: String,
        holder: Option<Box<LockFile>>,
    },

    #[error("Lock I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode lock file: {0}")]
    Encode(#[from] serde_json::Error),
}

fn held_message(dataset_id: &str, holder: Option<&LockFile>) -> String {
    match holder {
        Some(holder) => holder.holder_description(),
        None => format!(
            "Dataset {} is locked by an unknown holder (unreadable lock file)",
            dataset_id
        ),
    }
}

impl LockError {
    pub fn is_held(&self) -> bool {
        matches!(self, LockError::Held { .. })
    }
}

impl Classified for LockError {
    fn kind(&self) -> ErrorKind {
        match self {
            LockError::Held { .. } => ErrorKind::LockHeld,
            LockError::Io { .. } | LockError::Encode(_) => ErrorKind::LockIo,
        }
    }
}

/// A lock this client holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLock {
    pub dataset_id: String,
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// What is currently on the shared path for a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockFile),
    Stale(LockFile),
    /// A lock file exists but cannot be parsed; never reclaimed automatically
    Unreadable,
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Held(_) | LockState::Unreadable)
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct LockManager {
    storage: Arc<dyn LockStorage>,
    owner: LockOwner,
    clock: Clock,
}

impl LockManager {
    pub fn new(storage: Arc<dyn LockStorage>, owner: LockOwner) -> Self {
        Self {
            storage,
            owner,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for lease bookkeeping
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Try once to take the lock for `dataset_id`.
    ///
    /// Fails with [`LockError::Held`] on contention; callers surface that to
    /// the operator rather than spinning.
    pub async fn acquire(&self, dataset_id: &str, ttl: Duration) -> Result<DatasetLock, LockError> {
        if let Some(lock) = self.try_create(dataset_id, ttl).await? {
            return Ok(lock);
        }

        let first = match self.storage.read(dataset_id).await? {
            Some(bytes) => bytes,
            // Released between our create attempt and the read
            None => return self.create_or_report_held(dataset_id, ttl).await,
        };

        let existing = match LockFile::parse(&first) {
            Some(existing) => existing,
            None => {
                tracing::warn!(
                    "Unreadable lock file at {}; treating dataset {} as locked",
                    self.storage.location(dataset_id),
                    dataset_id
                );
                return Err(held(dataset_id, None));
            }
        };

        if !existing.is_stale_at(self.now()) {
            tracing::debug!("{}", existing.holder_description());
            return Err(held(dataset_id, Some(existing)));
        }

        let second = self.storage.read(dataset_id).await?;
        if second.as_deref() != Some(first.as_slice()) {
            tracing::info!(
                "Stale lock for {} changed while being inspected; leaving it in place",
                dataset_id
            );
            let current = second.as_deref().and_then(LockFile::parse);
            return Err(held(dataset_id, current.or(Some(existing))));
        }

        tracing::warn!(
            "Reclaiming stale lock for {} held by {}@{} since {}",
            dataset_id,
            existing.user,
            existing.host,
            existing.acquired_at
        );
        self.storage.delete(dataset_id).await?;
        self.create_or_report_held(dataset_id, ttl).await
    }

    /// Release a lock this client holds. A no-op when the lock is gone or
    /// now belongs to someone else.
    pub async fn release(&self, lock: &DatasetLock) -> Result<(), LockError> {
        let current = match self.storage.read(&lock.dataset_id).await? {
            Some(bytes) => bytes,
            None => {
                tracing::debug!("Lock for {} already released", lock.dataset_id);
                return Ok(());
            }
        };

        match LockFile::parse(&current) {
            Some(file) if file.owner_token == lock.owner_token => {
                self.storage.delete(&lock.dataset_id).await?;
                tracing::info!("Released lock for {}", lock.dataset_id);
            }
            _ => {
                tracing::warn!(
                    "Lock for {} was reclaimed by another client; not releasing it",
                    lock.dataset_id
                );
            }
        }
        Ok(())
    }

    /// Whether a live (or unreadable) lock currently guards `dataset_id`
    pub async fn is_locked(&self, dataset_id: &str) -> Result<bool, LockError> {
        Ok(self.inspect(dataset_id).await?.is_locked())
    }

    pub async fn inspect(&self, dataset_id: &str) -> Result<LockState, LockError> {
        let bytes = match self.storage.read(dataset_id).await? {
            Some(bytes) => bytes,
            None => return Ok(LockState::Free),
        };
        Ok(match LockFile::parse(&bytes) {
            Some(file) if file.is_stale_at(self.now()) => LockState::Stale(file),
            Some(file) => LockState::Held(file),
            None => LockState::Unreadable,
        })
    }

    /// Administrative removal regardless of owner. Returns whether a lock
    /// file was actually removed.
    pub async fn force_release(&self, dataset_id: &str) -> Result<bool, LockError> {
        let removed = self.storage.delete(dataset_id).await?;
        if removed {
            tracing::warn!(
                "Force-released lock for {} at {}",
                dataset_id,
                self.storage.location(dataset_id)
            );
        }
        Ok(removed)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    async fn try_create(&self, dataset_id: &str, ttl: Duration) -> Result<Option<DatasetLock>, LockError> {
        let file = LockFile::new(dataset_id, &self.owner, self.now(), ttl);
        let bytes = file.to_bytes()?;
        if !self.storage.create_exclusive(dataset_id, &bytes).await? {
            return Ok(None);
        }
        tracing::info!(
            "Acquired lock for {} at {}",
            dataset_id,
            self.storage.location(dataset_id)
        );
        Ok(Some(DatasetLock {
            dataset_id: dataset_id.to_string(),
            owner_token: file.owner_token,
            acquired_at: file.acquired_at,
            ttl,
        }))
    }

    async fn create_or_report_held(&self, dataset_id: &str, ttl: Duration) -> Result<DatasetLock, LockError> {
        if let Some(lock) = self.try_create(dataset_id, ttl).await? {
            return Ok(lock);
        }
        let holder = self
            .storage
            .read(dataset_id)
            .await?
            .as_deref()
            .and_then(LockFile::parse);
        Err(held(dataset_id, holder))
    }
}

fn held(dataset_id: &str, holder: Option<LockFile>) -> LockError {
    LockError::Held {
        dataset_id: dataset_id.to_string(),
        holder: holder.map(Box::new),
    }
}
