//! Testing utilities and fixtures
//!
//! [`TestContext`] lays out a temporary clone, lock share and image folder and
//! wires a [`WorkflowEngine`] to the scripted backends from [`scripted`].

pub mod scripted;

pub use scripted::{commit_info, CallLog, Failure, ScriptedLargeFiles, ScriptedVcs};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::lock::{FsLockStorage, LockManager, LockOwner, LockStorage};
use crate::retry::RetryPolicy;
use crate::workflow::{EngineSettings, WorkflowEngine};
use crate::workspace::Workspace;

/// Test context holding a scratch directory and the scripted collaborators
pub struct TestContext {
    pub temp_dir: TempDir,
    pub log: CallLog,
    pub vcs: ScriptedVcs,
    pub files: ScriptedLargeFiles,
    pub settings: EngineSettings,
}

impl TestContext {
    /// Create a new context with default scripts and a fast retry policy
    pub fn new() -> io::Result<Self> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("workspace"))?;
        fs::create_dir_all(temp_dir.path().join("locks"))?;

        let log = CallLog::new();
        Ok(Self {
            vcs: ScriptedVcs::new(log.clone()),
            files: ScriptedLargeFiles::new(log.clone()),
            log,
            settings: EngineSettings {
                retry: fast_retry(3),
                ..EngineSettings::default()
            },
            temp_dir,
        })
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp_dir.path().join("workspace")
    }

    pub fn locks_root(&self) -> PathBuf {
        self.temp_dir.path().join("locks")
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.workspace_root())
    }

    pub fn lock_storage(&self) -> Arc<dyn LockStorage> {
        Arc::new(FsLockStorage::new(self.locks_root()))
    }

    /// A lock manager on the shared lock root acting as `user`
    pub fn lock_manager(&self, user: &str) -> LockManager {
        LockManager::new(
            self.lock_storage(),
            LockOwner::named(user, &format!("{}-workstation", user)),
        )
    }

    /// Engine acting as `user` against the scripted backends
    pub fn engine_as(&self, user: &str) -> WorkflowEngine {
        WorkflowEngine::new(
            Arc::new(self.vcs.clone()),
            Arc::new(self.files.clone()),
            self.lock_manager(user),
            self.workspace(),
            self.settings.clone(),
        )
    }

    pub fn engine(&self) -> WorkflowEngine {
        self.engine_as("operator")
    }

    /// A source folder holding `count` small images
    pub fn image_folder(&self, name: &str, count: usize) -> io::Result<PathBuf> {
        let folder = self.temp_dir.path().join(name);
        fs::create_dir_all(&folder)?;
        for i in 0..count {
            fs::write(folder.join(format!("frame_{:04}.jpg", i)), [0xFF, 0xD8, i as u8])?;
        }
        Ok(folder)
    }

    /// Create a file relative to the workspace root
    pub fn create_workspace_file(&self, relative: &str, content: &str) -> io::Result<PathBuf> {
        create_file(&self.workspace_root(), relative, content)
    }
}

/// Retry policy with millisecond backoff for tests
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(5)).with_max_delay(Duration::from_millis(20))
}

/// Write `content` to `dir/relative`, creating parents
pub fn create_file(dir: &Path, relative: &str, content: &str) -> io::Result<PathBuf> {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        let context = TestContext::new().unwrap();
        assert!(context.workspace_root().is_dir());
        assert!(context.locks_root().is_dir());
        assert_eq!(context.settings.retry.max_attempts, 3);
    }

    #[test]
    fn test_image_folder() {
        let context = TestContext::new().unwrap();
        let folder = context.image_folder("camera", 3).unwrap();
        assert_eq!(fs::read_dir(folder).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_failures_replay_in_order() {
        use crate::backend::VcsBackend;
        use crate::error::{Classified, ErrorKind};

        let context = TestContext::new().unwrap();
        context.vcs.fail("git pull", Failure::Transient, 1);

        let err = context.vcs.pull("origin", "main").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        context.vcs.pull("origin", "main").await.unwrap();
        assert_eq!(context.log.count("git pull"), 2);
    }

    #[tokio::test]
    async fn test_scripted_push_rejections() {
        use crate::backend::{PushOutcome, VcsBackend};

        let context = TestContext::new().unwrap();
        context.vcs.reject_pushes(1);
        assert_eq!(
            context.vcs.push("origin", "main").await.unwrap(),
            PushOutcome::RejectedNonFastForward
        );
        assert_eq!(context.vcs.push("origin", "main").await.unwrap(), PushOutcome::Pushed);
    }
}
