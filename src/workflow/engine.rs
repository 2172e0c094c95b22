use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::event::{EventReceiver, EventSink, WorkflowEvent};
use super::plan::{plan, Step};
use super::request::WorkflowRequest;
use super::state::{WorkflowKind, WorkflowRun, WorkflowState};
use crate::backend::{
    BackendError, CommitOutcome, LargeFileBackend, PushOutcome, TransferOptions, VcsBackend,
};
use crate::cancel::CancelToken;
use crate::error::{Classified, ErrorKind, WorkflowError};
use crate::lock::{DatasetLock, LockError, LockManager};
use crate::retry::{ErrorClass, RetryError, RetryExecutor, RetryNotice, RetryPolicy};
use crate::workspace::{
    clear_folder, copy_files, validate_dataset_id, validate_image_folder, DatasetMetadata,
    Workspace, WorkspaceError,
};

/// Externally supplied knobs the engine runs with
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub remote: String,
    pub branch: String,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            lock_ttl: Duration::from_secs(4 * 3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Final snapshot of a run, returned once it reaches a terminal state
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub kind: WorkflowKind,
    pub dataset_id: String,
    pub state: WorkflowState,
    pub summary: String,
    pub error: Option<WorkflowError>,
    pub completed_steps: Vec<Step>,
    /// Backoff delays slept between retried attempts, in order
    pub retry_delays: Vec<Duration>,
}

/// Caller's side of a started run
pub struct WorkflowHandle {
    run_id: Uuid,
    kind: WorkflowKind,
    dataset_id: String,
    cancel: CancelToken,
    events: EventReceiver,
    task: JoinHandle<RunOutcome>,
}

impl WorkflowHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Request cooperative cancellation; observed at the next step boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the run has stopped and the channel drained
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal state, discarding undelivered events
    pub async fn wait(self) -> RunOutcome {
        let Self {
            run_id,
            kind,
            dataset_id,
            task,
            ..
        } = self;
        join_outcome(task, run_id, kind, dataset_id).await
    }

    /// Drain every event, then return the terminal outcome
    pub async fn collect(mut self) -> (Vec<WorkflowEvent>, RunOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.wait().await)
    }
}

async fn join_outcome(
    task: JoinHandle<RunOutcome>,
    run_id: Uuid,
    kind: WorkflowKind,
    dataset_id: String,
) -> RunOutcome {
    match task.await {
        Ok(outcome) => outcome,
        // The task's finish guard already delivered the terminal event
        Err(e) => {
            let error = WorkflowError::new(ErrorKind::FatalBackend, format!("Run aborted: {}", e));
            RunOutcome {
                run_id,
                kind,
                dataset_id,
                state: WorkflowState::Failed,
                summary: error.message.clone(),
                error: Some(error),
                completed_steps: Vec::new(),
                retry_delays: Vec::new(),
            }
        }
    }
}

/// What a finished step tells the driver
enum StepFlow {
    Continue,
    /// End the run successfully without the remaining steps
    Finish(String),
}

/// Facts gathered while running, used for the summary
#[derive(Debug, Default)]
struct RunNotes {
    images: usize,
    removed: Option<usize>,
    changes: usize,
    revision: Option<String>,
}

struct RunContext {
    run: WorkflowRun,
    request: WorkflowRequest,
    sink: EventSink,
    retry: RetryExecutor,
    lock: Option<DatasetLock>,
    notes: RunNotes,
    index: usize,
    total: usize,
}

impl RunContext {
    /// Overall completion with `within` of the current step done
    fn fraction(&self, within: f64) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.index as f64 + within.clamp(0.0, 1.0)) / self.total as f64
    }

    fn dataset_id(&self) -> &str {
        &self.run.dataset_id
    }
}

/// Runs workflows against one local clone
#[derive(Clone)]
pub struct WorkflowEngine {
    vcs: Arc<dyn VcsBackend>,
    files: Arc<dyn LargeFileBackend>,
    locks: LockManager,
    workspace: Workspace,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(
        vcs: Arc<dyn VcsBackend>,
        files: Arc<dyn LargeFileBackend>,
        locks: LockManager,
        workspace: Workspace,
        settings: EngineSettings,
    ) -> Self {
        Self {
            vcs,
            files,
            locks,
            workspace,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn vcs(&self) -> &Arc<dyn VcsBackend> {
        &self.vcs
    }

    /// Start a run on its own task and return immediately
    pub fn start(&self, request: WorkflowRequest) -> WorkflowHandle {
        self.start_with(Uuid::new_v4(), request, CancelToken::new(), ())
    }

    /// Start a run; `guard` is dropped when the run task ends
    pub fn start_with<G>(
        &self,
        run_id: Uuid,
        request: WorkflowRequest,
        cancel: CancelToken,
        guard: G,
    ) -> WorkflowHandle
    where
        G: Send + 'static,
    {
        let kind = request.kind();
        let dataset_id = request.dataset_id().to_string();
        let (sink, events) = EventSink::channel();

        let engine = self.clone();
        let token = cancel.clone();
        let finish = sink.finish_on_drop();
        let task = tokio::spawn(async move {
            let outcome = engine.execute(run_id, request, token, sink).await;
            drop(finish);
            drop(guard);
            outcome
        });

        WorkflowHandle {
            run_id,
            kind,
            dataset_id,
            cancel,
            events,
            task,
        }
    }

    /// Drive one run to a terminal state on the current task.
    ///
    /// The dataset lock, when taken, is released before the terminal event
    /// is emitted on every path, including panics inside a step.
    pub async fn execute(
        &self,
        run_id: Uuid,
        request: WorkflowRequest,
        cancel: CancelToken,
        sink: EventSink,
    ) -> RunOutcome {
        let run = WorkflowRun::new(run_id, request.kind(), request.dataset_id(), cancel);
        let mut ctx = RunContext {
            run,
            request,
            sink,
            retry: RetryExecutor::new(self.settings.retry.clone()),
            lock: None,
            notes: RunNotes::default(),
            index: 0,
            total: 0,
        };

        info!(
            "Starting {} for dataset {} (run {})",
            ctx.run.kind, ctx.run.dataset_id, run_id
        );
        if let Err(e) = ctx.run.transition(WorkflowState::Running) {
            warn!("{}", e);
        }

        let result = AssertUnwindSafe(self.drive(&mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(WorkflowError::new(
                    ErrorKind::FatalBackend,
                    "Internal error: workflow step panicked",
                ))
            });

        if let Some(lock) = ctx.lock.take() {
            self.release_lock(&lock).await;
        }

        let (state, summary) = match result {
            Ok(summary) => (WorkflowState::Completed, summary),
            Err(e) if e.kind.is_cancellation() => {
                info!("{} for {} cancelled: {}", ctx.run.kind, ctx.run.dataset_id, e.message);
                (WorkflowState::Cancelled, e.message)
            }
            Err(e) => {
                error!("{} for {} failed: {}", ctx.run.kind, ctx.run.dataset_id, e);
                ctx.sink.error(&e);
                let summary = e.message.clone();
                ctx.run.last_error = Some(e);
                (WorkflowState::Failed, summary)
            }
        };

        if let Err(e) = ctx.run.transition(state) {
            warn!("{}", e);
        }
        ctx.sink.finish(state, &summary);

        RunOutcome {
            run_id,
            kind: ctx.run.kind,
            dataset_id: ctx.run.dataset_id.clone(),
            state,
            summary,
            error: ctx.run.last_error.clone(),
            completed_steps: ctx.run.completed_steps.clone(),
            retry_delays: ctx
                .retry
                .metrics()
                .await
                .retries
                .into_iter()
                .map(|(_, delay)| delay)
                .collect(),
        }
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<String, WorkflowError> {
        validate_dataset_id(ctx.dataset_id()).map_err(|e| WorkflowError::from_classified(&e))?;

        if let WorkflowRequest::RestoreVersion {
            confirmed: false, ..
        } = ctx.request
        {
            return Err(WorkflowError::invalid_request(
                "Restoring a previous version requires explicit confirmation",
            ));
        }

        let steps = plan(&ctx.request);
        ctx.total = steps.len();

        for (index, step) in steps.into_iter().enumerate() {
            if ctx.run.cancel_requested() {
                info!("Cancellation observed before '{}'", step);
                return Err(WorkflowError::new(
                    ErrorKind::CancelledByUser,
                    format!("Cancelled by user before {}.", step),
                ));
            }

            ctx.index = index;
            ctx.run.current_step = Some(step);
            ctx.sink.progress(step, ctx.fraction(0.0), None);

            let flow = self.run_step(ctx, step).await.map_err(|e| e.at_step(step.label()))?;
            ctx.run.completed_steps.push(step);

            if let StepFlow::Finish(summary) = flow {
                return Ok(summary);
            }
        }

        ctx.run.current_step = None;
        Ok(self.summary(ctx))
    }

    async fn run_step(&self, ctx: &mut RunContext, step: Step) -> Result<StepFlow, WorkflowError> {
        let dataset_id = ctx.dataset_id().to_string();

        match step {
            Step::AcquireLock => {
                ctx.lock = Some(self.acquire_lock(ctx).await?);
            }
            Step::ValidateSource => {
                let source = import_source(&ctx.request)?;
                let summary = blocking(move || validate_image_folder(&source)).await?;
                ctx.notes.images = summary.files;
            }
            Step::CheckCleanWorkspace => {
                let status = self.vcs.status(None).await.map_err(local)?;
                if !status.is_clean() {
                    return Err(WorkflowError::invalid_request(
                        "Workspace has local changes. Commit or discard them before fetching latest.",
                    ));
                }
            }
            Step::CheckAttachedHead => {
                if self.vcs.current_head().await.map_err(local)?.is_detached() {
                    return Err(WorkflowError::new(
                        ErrorKind::FatalBackend,
                        "Workspace is on a restored version (detached HEAD): return to latest first.",
                    ));
                }
            }
            Step::DetectChanges => {
                let dir = Workspace::relative_dataset_dir(&dataset_id);
                let status = self.vcs.status(Some(&dir)).await.map_err(local)?;
                ctx.notes.changes = status.changes.len();
                info!("{} local change(s) under {}", ctx.notes.changes, dir.display());
            }
            Step::DiscardLocalChanges => {
                self.vcs.discard_local_changes().await.map_err(local)?;
            }
            Step::PullMetadata => {
                let (vcs, remote, branch) = (&self.vcs, &self.settings.remote, &self.settings.branch);
                self.network(ctx, step, || vcs.pull(remote, branch)).await?;
            }
            Step::PullData => {
                let files = &self.files;
                let options = self.transfer_options(ctx, step);
                let everything: &[PathBuf] = &[];
                self.network(ctx, step, || files.pull(everything, options.clone()))
                    .await?;
            }
            Step::ClearData => {
                let data_dir = self.workspace.data_dir(&dataset_id);
                let removed = blocking(move || clear_folder(&data_dir)).await?;
                ctx.notes.removed = Some(removed);
            }
            Step::CopyFiles => self.copy_images(ctx).await?,
            Step::WriteMetadata => {
                let path = self.workspace.metadata_path(&dataset_id);
                let source = import_source(&ctx.request)?;
                let note = match &ctx.request {
                    WorkflowRequest::Import { note, .. } => note.clone(),
                    _ => None,
                };
                let images = ctx.notes.images;
                blocking(move || {
                    let mut metadata = DatasetMetadata::read(&path)
                        .unwrap_or_else(|_| DatasetMetadata::new(&dataset_id));
                    metadata.source = source.display().to_string();
                    metadata.import_note = Some(note.unwrap_or_else(|| {
                        format!("Imported {} images from {}", images, source.display())
                    }));
                    metadata.write(&path)
                })
                .await?;
            }
            Step::TrackData => {
                let data = vec![Workspace::relative_data_dir(&dataset_id)];
                let options = self.transfer_options(ctx, step);
                self.files.track(&data, options).await.map_err(local)?;
            }
            Step::StageFiles => {
                let paths = Workspace::import_stage_paths(&dataset_id);
                self.vcs.stage(&paths).await.map_err(local)?;
            }
            Step::StageDataset => {
                let dir = Workspace::relative_dataset_dir(&dataset_id);
                self.vcs.stage_all(&dir).await.map_err(local)?;
            }
            Step::Commit => {
                let message = self.commit_message(ctx);
                match self.vcs.commit(&message).await.map_err(local)? {
                    CommitOutcome::Created { revision } => {
                        info!("Created commit {} for {}", revision, dataset_id);
                        ctx.notes.revision = Some(revision);
                    }
                    CommitOutcome::NoChanges => {
                        ctx.sink
                            .progress(step, 1.0, Some("No changes to push".to_string()));
                        return Ok(StepFlow::Finish(self.no_change_summary(ctx)));
                    }
                }
            }
            Step::PushData => {
                let files = &self.files;
                let pointer = [Workspace::relative_pointer(&dataset_id)];
                let targets: &[PathBuf] = &pointer;
                let options = self.transfer_options(ctx, step);
                self.network(ctx, step, || files.push(targets, options.clone()))
                    .await?;
            }
            Step::PushMetadata => self.push_metadata(ctx).await?,
            Step::CheckoutRevision => {
                let revision = match &ctx.request {
                    WorkflowRequest::RestoreVersion { revision, .. } => revision.clone(),
                    _ => return Err(unexpected_step(step)),
                };
                self.vcs.checkout(&revision).await.map_err(local)?;
                ctx.notes.revision = Some(revision);
            }
            Step::CheckoutBranch => {
                self.vcs.checkout(&self.settings.branch).await.map_err(local)?;
            }
            Step::CheckoutData => {
                let options = self.transfer_options(ctx, step);
                self.files.checkout(&[], options).await.map_err(local)?;
            }
        }

        Ok(StepFlow::Continue)
    }

    /// Run a network-facing call through the retry policy.
    ///
    /// Only abortable steps observe the run's cancel token; any other step,
    /// once started, runs through its retries to completion.
    async fn network<T, F, Fut>(&self, ctx: &RunContext, step: Step, mut operation: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let cancel = if step.is_abortable() {
            ctx.run.cancel.clone()
        } else {
            CancelToken::new()
        };
        let sink = ctx.sink.clone();
        let fraction = ctx.fraction(0.0);

        ctx.retry
            .execute(
                step.label(),
                &cancel,
                classify_backend_error,
                |notice: &RetryNotice| sink.progress(step, fraction, Some(notice.describe())),
                |_attempt| operation(),
            )
            .await
            .map_err(retry_failure)
    }

    async fn acquire_lock(&self, ctx: &RunContext) -> Result<DatasetLock, WorkflowError> {
        let locks = &self.locks;
        let dataset_id = ctx.dataset_id();
        let ttl = self.settings.lock_ttl;
        let sink = ctx.sink.clone();

        ctx.retry
            .execute(
                Step::AcquireLock.label(),
                &ctx.run.cancel,
                |e: &LockError| {
                    if e.is_held() {
                        ErrorClass::Fatal
                    } else {
                        ErrorClass::Retryable
                    }
                },
                |notice: &RetryNotice| {
                    sink.progress(Step::AcquireLock, 0.0, Some(notice.describe()))
                },
                |_attempt| locks.acquire(dataset_id, ttl),
            )
            .await
            .map_err(retry_failure)
    }

    /// Release on the way out. Uses its own token so a cancelled run still
    /// retries a flaky release.
    async fn release_lock(&self, lock: &DatasetLock) {
        let executor = RetryExecutor::new(self.settings.retry.clone());
        let locks = &self.locks;
        let result = executor
            .execute(
                "release lock",
                &CancelToken::new(),
                |_: &LockError| ErrorClass::Retryable,
                |_: &RetryNotice| {},
                |_attempt| locks.release(lock),
            )
            .await;

        if let Err(e) = result {
            let detail = e
                .into_error()
                .map(|e| e.to_string())
                .unwrap_or_default();
            warn!(
                "Failed to release lock for {}; it expires after its ttl: {}",
                lock.dataset_id, detail
            );
        }
    }

    async fn copy_images(&self, ctx: &mut RunContext) -> Result<(), WorkflowError> {
        let source = import_source(&ctx.request)?;
        let target = self.workspace.data_dir(ctx.dataset_id());
        let sink = ctx.sink.clone();
        let (index, total) = (ctx.index as f64, ctx.total as f64);

        let summary = blocking(move || {
            let mut last_percent = usize::MAX;
            copy_files(&source, &target, |done, count| {
                let percent = done * 100 / count.max(1);
                if percent != last_percent {
                    last_percent = percent;
                    let within = percent as f64 / 100.0;
                    sink.progress(Step::CopyFiles, (index + within) / total, None);
                }
            })
        })
        .await?;

        info!("Copied {} file(s), {} bytes", summary.files, summary.bytes);
        ctx.notes.images = ctx.notes.images.max(summary.files);
        Ok(())
    }

    async fn push_metadata(&self, ctx: &RunContext) -> Result<(), WorkflowError> {
        let step = Step::PushMetadata;
        let (vcs, remote, branch) = (&self.vcs, &self.settings.remote, &self.settings.branch);

        if self.network(ctx, step, || vcs.push(remote, branch)).await? == PushOutcome::Pushed {
            return Ok(());
        }

        ctx.sink.progress(
            step,
            ctx.fraction(0.5),
            Some("Remote moved, rebasing and retrying push".to_string()),
        );
        self.network(ctx, step, || vcs.pull(remote, branch)).await?;

        match self.network(ctx, step, || vcs.push(remote, branch)).await? {
            PushOutcome::Pushed => Ok(()),
            PushOutcome::RejectedNonFastForward => Err(WorkflowError::new(
                ErrorKind::FatalBackend,
                format!(
                    "Push to {}/{} rejected again after rebasing; fetch latest and retry",
                    remote, branch
                ),
            )),
        }
    }

    fn transfer_options(&self, ctx: &RunContext, step: Step) -> TransferOptions {
        let sink = ctx.sink.clone();
        let (index, total) = (ctx.index as f64, ctx.total.max(1) as f64);
        let mut options = TransferOptions::default().with_progress(Arc::new(move |within: f64| {
            sink.progress(step, (index + within) / total, None)
        }));
        if step.is_abortable() {
            options = options.with_cancel(ctx.run.cancel.clone());
        }
        options
    }

    fn commit_message(&self, ctx: &RunContext) -> String {
        match &ctx.request {
            WorkflowRequest::Import { replace: true, .. } => {
                format!("Replace: {} images into {}", ctx.notes.images, ctx.dataset_id())
            }
            WorkflowRequest::Import { .. } => {
                format!("Import: {} images into {}", ctx.notes.images, ctx.dataset_id())
            }
            WorkflowRequest::Publish { message, .. } => message.clone(),
            _ => format!("Update {}", ctx.dataset_id()),
        }
    }

    fn no_change_summary(&self, ctx: &RunContext) -> String {
        match ctx.request.kind() {
            WorkflowKind::Publish => format!("No local change detected in {}.", ctx.dataset_id()),
            _ => format!(
                "No dataset change detected; {} is already up to date.",
                ctx.dataset_id()
            ),
        }
    }

    fn summary(&self, ctx: &RunContext) -> String {
        let id = ctx.dataset_id();
        let notes = &ctx.notes;
        match &ctx.request {
            WorkflowRequest::Import { .. } => match notes.removed {
                Some(removed) => format!(
                    "Replaced dataset {} with {} images (removed {} previous files).",
                    id, notes.images, removed
                ),
                None => format!("Imported and published {} images into {}.", notes.images, id),
            },
            WorkflowRequest::Publish { .. } => format!(
                "Published {} change(s) to {} as {}.",
                notes.changes,
                id,
                notes.revision.as_deref().unwrap_or("a new commit")
            ),
            WorkflowRequest::FetchLatest { .. } => format!(
                "Workspace synced with {}/{}.",
                self.settings.remote, self.settings.branch
            ),
            WorkflowRequest::RestoreVersion { revision, .. } => {
                format!("Restored {} to version {}.", id, revision)
            }
            WorkflowRequest::ReturnToLatest { .. } => {
                format!("Returned to latest {}.", self.settings.branch)
            }
        }
    }
}

fn classify_backend_error(error: &BackendError) -> ErrorClass {
    match error.kind() {
        ErrorKind::CancelledByUser => ErrorClass::Cancelled,
        ErrorKind::TransientNetwork | ErrorKind::Timeout => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

fn retry_failure<E: Classified>(error: RetryError<E>) -> WorkflowError {
    match error {
        RetryError::Cancelled => WorkflowError::cancelled(),
        RetryError::Fatal { error, .. } => WorkflowError::from_classified(&error),
        RetryError::Exhausted { error, attempts } => WorkflowError::new(
            error.kind(),
            format!("{} (gave up after {} attempts)", error, attempts),
        ),
    }
}

fn local<E: Classified>(error: E) -> WorkflowError {
    WorkflowError::from_classified(&error)
}

fn unexpected_step(step: Step) -> WorkflowError {
    WorkflowError::invalid_request(format!("Step '{}' does not apply to this request", step))
}

fn import_source(request: &WorkflowRequest) -> Result<PathBuf, WorkflowError> {
    match request {
        WorkflowRequest::Import { source, .. } => Ok(source.clone()),
        _ => Err(unexpected_step(Step::ValidateSource)),
    }
}

/// Run blocking filesystem work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, WorkflowError>
where
    F: FnOnce() -> Result<T, WorkspaceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkflowError::io(format!("Background task failed: {}", e)))?
        .map_err(|e| WorkflowError::from_classified(&e))
}
