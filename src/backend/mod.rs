//! Collaborator interfaces for the metadata VCS and the large-file store
//!
//! The engine only depends on [`VcsBackend`] and [`LargeFileBackend`]. The
//! CLI-backed implementations run `git` and `dvc` through a
//! [`ProcessRunner`](crate::subprocess::ProcessRunner) so every call inherits
//! the runner's timeout and watchdog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::{Classified, ErrorKind};
use crate::subprocess::ProcessError;

pub mod dvc;
pub mod git;

pub use dvc::DvcCli;
pub use git::GitCli;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Unexpected {tool} output for '{operation}': {detail}")]
    Parse {
        tool: &'static str,
        operation: String,
        detail: String,
    },

    #[error("I/O error repairing backend state at {}: {source}", .path.display())]
    Repair {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classified for BackendError {
    fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Process(e) => e.kind(),
            BackendError::Parse { .. } => ErrorKind::FatalBackend,
            BackendError::Repair { .. } => ErrorKind::Io,
        }
    }
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Process(e) if e.is_cancelled())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Created { revision: String },
    /// Nothing was staged; the commit was a no-op
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote moved ahead; integrate and push again
    RejectedNonFastForward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    Attached(String),
    Detached(String),
}

impl Head {
    pub fn is_detached(&self) -> bool {
        matches!(self, Head::Detached(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceStatus {
    pub branch: Option<String>,
    pub detached: bool,
    pub changes: Vec<FileChange>,
}

impl WorkspaceStatus {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub revision: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub summary: String,
}

/// Receives the in-step completion fraction in `0.0..=1.0`
pub type FractionHandler = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress and abort hooks for one large-file transfer
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub on_progress: Option<FractionHandler>,
    pub cancel: Option<CancelToken>,
}

impl TransferOptions {
    pub fn with_progress(mut self, handler: FractionHandler) -> Self {
        self.on_progress = Some(handler);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Metadata version control (history, staging, remotes)
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Stage the given repository-relative paths. Paths that no longer exist
    /// are skipped; staging nothing is not an error.
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), BackendError>;

    /// Stage every addition, modification and deletion under `path`
    async fn stage_all(&self, path: &Path) -> Result<(), BackendError>;

    async fn commit(&self, message: &str) -> Result<CommitOutcome, BackendError>;

    async fn push(&self, remote: &str, branch: &str) -> Result<PushOutcome, BackendError>;

    /// Integrate the remote branch, rebasing local commits on top
    async fn pull(&self, remote: &str, branch: &str) -> Result<(), BackendError>;

    async fn checkout(&self, revision: &str) -> Result<(), BackendError>;

    async fn current_head(&self) -> Result<Head, BackendError>;

    /// Working tree status, optionally limited to `path`
    async fn status(&self, path: Option<&Path>) -> Result<WorkspaceStatus, BackendError>;

    /// Throw away uncommitted local edits in the clone
    async fn discard_local_changes(&self) -> Result<(), BackendError>;

    /// Most recent commits touching `path`, newest first
    async fn log(&self, path: &Path, max: usize) -> Result<Vec<CommitInfo>, BackendError>;
}

/// Large binary content versioning
#[async_trait]
pub trait LargeFileBackend: Send + Sync {
    async fn track(&self, paths: &[PathBuf], options: TransferOptions) -> Result<(), BackendError>;

    async fn pull(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError>;

    async fn push(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError>;

    /// Materialize content matching the checked-out metadata
    async fn checkout(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError>;
}
