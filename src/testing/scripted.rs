//! Scripted in-memory backends
//!
//! [`ScriptedVcs`] and [`ScriptedLargeFiles`] record every call into a shared
//! [`CallLog`] and replay failures queued per operation, so a test can assert
//! the exact order in which a workflow touched its collaborators.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{
    BackendError, CommitInfo, CommitOutcome, FileChange, Head, LargeFileBackend, PushOutcome,
    TransferOptions, VcsBackend, WorkspaceStatus,
};
use crate::subprocess::ProcessError;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure a scripted call replays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Remote unreachable; classified as transient and retried
    Transient,
    /// Rejected for good (authentication)
    Fatal,
    /// Subprocess watchdog fired
    Timeout,
    /// Transfer aborted by the cancel token
    Cancelled,
}

impl Failure {
    pub fn to_error(self, operation: &str) -> BackendError {
        let command = operation.to_string();
        let error = match self {
            Failure::Transient => ProcessError::NonZeroExit {
                command,
                code: 128,
                message: "fatal: unable to access 'https://remote/datasets.git/': Could not resolve host: remote".to_string(),
            },
            Failure::Fatal => ProcessError::NonZeroExit {
                command,
                code: 128,
                message: "fatal: Authentication failed for 'https://remote/datasets.git/'".to_string(),
            },
            Failure::Timeout => ProcessError::Timeout {
                command,
                timeout: Duration::from_secs(1),
            },
            Failure::Cancelled => ProcessError::Cancelled { command },
        };
        BackendError::Process(error)
    }
}

/// Ordered record of backend calls shared by both scripted backends
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: &str) {
        locked(&self.0).push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.0).clone()
    }

    pub fn count(&self, call: &str) -> usize {
        locked(&self.0).iter().filter(|c| *c == call).count()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.count(call) > 0
    }

    /// Index of the first occurrence of `call`
    pub fn position(&self, call: &str) -> Option<usize> {
        locked(&self.0).iter().position(|c| c == call)
    }

    pub fn clear(&self) {
        locked(&self.0).clear();
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Per-operation failure queues and call hooks
#[derive(Default)]
struct Script {
    failures: HashMap<String, VecDeque<Failure>>,
    hooks: HashMap<String, Vec<Hook>>,
}

impl Script {
    fn fail(&mut self, operation: &str, failure: Failure, times: usize) {
        self.failures
            .entry(operation.to_string())
            .or_default()
            .extend(std::iter::repeat(failure).take(times));
    }

    fn on_call(&mut self, operation: &str, hook: Hook) {
        self.hooks.entry(operation.to_string()).or_default().push(hook);
    }

    fn hooks(&self, operation: &str) -> Vec<Hook> {
        self.hooks.get(operation).cloned().unwrap_or_default()
    }

    fn next_failure(&mut self, operation: &str) -> Option<Failure> {
        self.failures.get_mut(operation).and_then(VecDeque::pop_front)
    }
}

/// Record the call, run its hooks outside the lock, then replay a queued failure
fn enter(log: &CallLog, script: &Mutex<Script>, operation: &str) -> Result<(), BackendError> {
    log.record(operation);
    let hooks = locked(script).hooks(operation);
    for hook in hooks {
        hook();
    }
    match locked(script).next_failure(operation) {
        Some(failure) => Err(failure.to_error(operation)),
        None => Ok(()),
    }
}

struct VcsState {
    head: Head,
    status: WorkspaceStatus,
    commit: CommitOutcome,
    rejections: usize,
    history: Vec<CommitInfo>,
    messages: Vec<String>,
    staged: Vec<PathBuf>,
}

/// In-memory [`VcsBackend`]. Operation names are `git <verb>`, e.g.
/// `git pull`, `git commit`, `git push`.
#[derive(Clone)]
pub struct ScriptedVcs {
    log: CallLog,
    script: Arc<Mutex<Script>>,
    state: Arc<Mutex<VcsState>>,
}

impl ScriptedVcs {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            script: Arc::default(),
            state: Arc::new(Mutex::new(VcsState {
                head: Head::Attached("main".to_string()),
                status: WorkspaceStatus {
                    branch: Some("main".to_string()),
                    ..WorkspaceStatus::default()
                },
                commit: CommitOutcome::Created {
                    revision: "c0ffee1".to_string(),
                },
                rejections: 0,
                history: Vec::new(),
                messages: Vec::new(),
                staged: Vec::new(),
            })),
        }
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail(&self, operation: &str, failure: Failure, times: usize) -> &Self {
        locked(&self.script).fail(operation, failure, times);
        self
    }

    /// Run `hook` every time `operation` is called, before it returns
    pub fn on_call<F>(&self, operation: &str, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        locked(&self.script).on_call(operation, Arc::new(hook));
        self
    }

    pub fn set_head(&self, head: Head) -> &Self {
        locked(&self.state).head = head;
        self
    }

    pub fn set_changes(&self, changes: Vec<FileChange>) -> &Self {
        locked(&self.state).status.changes = changes;
        self
    }

    pub fn set_commit_outcome(&self, outcome: CommitOutcome) -> &Self {
        locked(&self.state).commit = outcome;
        self
    }

    /// Reject the next `times` pushes as non-fast-forward
    pub fn reject_pushes(&self, times: usize) -> &Self {
        locked(&self.state).rejections = times;
        self
    }

    pub fn set_history(&self, history: Vec<CommitInfo>) -> &Self {
        locked(&self.state).history = history;
        self
    }

    pub fn commit_messages(&self) -> Vec<String> {
        locked(&self.state).messages.clone()
    }

    pub fn staged(&self) -> Vec<PathBuf> {
        locked(&self.state).staged.clone()
    }

    pub fn head(&self) -> Head {
        locked(&self.state).head.clone()
    }

    fn enter(&self, operation: &str) -> Result<(), BackendError> {
        enter(&self.log, &self.script, operation)
    }
}

#[async_trait]
impl VcsBackend for ScriptedVcs {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), BackendError> {
        self.enter("git add")?;
        locked(&self.state).staged.extend_from_slice(paths);
        Ok(())
    }

    async fn stage_all(&self, path: &Path) -> Result<(), BackendError> {
        self.enter("git add -A")?;
        locked(&self.state).staged.push(path.to_path_buf());
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitOutcome, BackendError> {
        self.enter("git commit")?;
        let mut state = locked(&self.state);
        state.messages.push(message.to_string());
        Ok(state.commit.clone())
    }

    async fn push(&self, _remote: &str, _branch: &str) -> Result<PushOutcome, BackendError> {
        self.enter("git push")?;
        let mut state = locked(&self.state);
        if state.rejections > 0 {
            state.rejections -= 1;
            return Ok(PushOutcome::RejectedNonFastForward);
        }
        Ok(PushOutcome::Pushed)
    }

    async fn pull(&self, _remote: &str, _branch: &str) -> Result<(), BackendError> {
        self.enter("git pull")
    }

    async fn checkout(&self, revision: &str) -> Result<(), BackendError> {
        self.enter("git checkout")?;
        let mut state = locked(&self.state);
        state.head = if revision == "main" {
            Head::Attached(revision.to_string())
        } else {
            Head::Detached(revision.to_string())
        };
        Ok(())
    }

    async fn current_head(&self) -> Result<Head, BackendError> {
        self.enter("git head")?;
        Ok(self.head())
    }

    async fn status(&self, _path: Option<&Path>) -> Result<WorkspaceStatus, BackendError> {
        self.enter("git status")?;
        let state = locked(&self.state);
        let mut status = state.status.clone();
        status.detached = state.head.is_detached();
        Ok(status)
    }

    async fn discard_local_changes(&self) -> Result<(), BackendError> {
        self.enter("git reset")?;
        locked(&self.state).status.changes.clear();
        Ok(())
    }

    async fn log(&self, _path: &Path, max: usize) -> Result<Vec<CommitInfo>, BackendError> {
        self.enter("git log")?;
        Ok(locked(&self.state).history.iter().take(max).cloned().collect())
    }
}

struct FilesState {
    fractions: Vec<f64>,
    delay: Duration,
    transfers: Vec<(String, Vec<PathBuf>)>,
}

/// In-memory [`LargeFileBackend`]. Operation names are `dvc <verb>`.
///
/// Transfers report each scripted fraction through the progress hook and
/// stop with a cancellation error as soon as their token is set.
#[derive(Clone)]
pub struct ScriptedLargeFiles {
    log: CallLog,
    script: Arc<Mutex<Script>>,
    state: Arc<Mutex<FilesState>>,
}

impl ScriptedLargeFiles {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            script: Arc::default(),
            state: Arc::new(Mutex::new(FilesState {
                fractions: vec![0.5, 1.0],
                delay: Duration::ZERO,
                transfers: Vec::new(),
            })),
        }
    }

    pub fn fail(&self, operation: &str, failure: Failure, times: usize) -> &Self {
        locked(&self.script).fail(operation, failure, times);
        self
    }

    pub fn on_call<F>(&self, operation: &str, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        locked(&self.script).on_call(operation, Arc::new(hook));
        self
    }

    /// Sleep this long between reported fractions
    pub fn with_delay(&self, delay: Duration) -> &Self {
        locked(&self.state).delay = delay;
        self
    }

    pub fn set_fractions(&self, fractions: Vec<f64>) -> &Self {
        locked(&self.state).fractions = fractions;
        self
    }

    /// `(operation, targets)` for every call that got past its script
    pub fn transfers(&self) -> Vec<(String, Vec<PathBuf>)> {
        locked(&self.state).transfers.clone()
    }

    async fn transfer(
        &self,
        operation: &str,
        targets: &[PathBuf],
        options: TransferOptions,
    ) -> Result<(), BackendError> {
        enter(&self.log, &self.script, operation)?;

        let (fractions, delay) = {
            let mut state = locked(&self.state);
            state
                .transfers
                .push((operation.to_string(), targets.to_vec()));
            (state.fractions.clone(), state.delay)
        };

        for fraction in fractions {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Failure::Cancelled.to_error(operation));
            }
            if let Some(on_progress) = &options.on_progress {
                on_progress(fraction);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LargeFileBackend for ScriptedLargeFiles {
    async fn track(&self, paths: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.transfer("dvc add", paths, options).await
    }

    async fn pull(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.transfer("dvc pull", targets, options).await
    }

    async fn push(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.transfer("dvc push", targets, options).await
    }

    async fn checkout(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.transfer("dvc checkout", targets, options).await
    }
}

/// A commit entry for history fixtures
pub fn commit_info(revision: &str, summary: &str) -> CommitInfo {
    CommitInfo {
        revision: revision.to_string(),
        author: "operator".to_string(),
        date: Utc::now(),
        summary: summary.to_string(),
    }
}
