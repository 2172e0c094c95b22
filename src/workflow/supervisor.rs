//! Per-dataset scheduling and bounded shutdown
//!
//! The supervisor admits at most one active run per dataset in this process
//! and tracks them so the host can cancel everything and wait for the
//! finalizers (lock release included) before exiting.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::{WorkflowEngine, WorkflowHandle};
use super::request::WorkflowRequest;
use super::state::WorkflowKind;
use crate::cancel::CancelToken;
use crate::error::{Classified, ErrorKind};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("A {kind} run ({run_id}) is already active for dataset {dataset_id}")]
    DatasetBusy {
        dataset_id: String,
        run_id: Uuid,
        kind: WorkflowKind,
    },

    #[error("Shutting down; no new workflows are accepted")]
    ShuttingDown,
}

impl Classified for SupervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::DatasetBusy { .. } => ErrorKind::LockHeld,
            SupervisorError::ShuttingDown => ErrorKind::InvalidRequest,
        }
    }
}

/// A run the supervisor is currently tracking
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub dataset_id: String,
    pub run_id: Uuid,
    pub kind: WorkflowKind,
    #[serde(skip)]
    cancel: CancelToken,
}

/// What [`WorkflowSupervisor::shutdown`] managed to do
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Datasets whose runs were asked to cancel
    pub cancelled: Vec<String>,
    /// Datasets still running when the grace period ran out
    pub unfinished: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unfinished.is_empty()
    }
}

struct Shared {
    active: Mutex<HashMap<String, ActiveRun>>,
    idle: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frees the dataset slot when the run task ends, however it ends
struct SlotGuard {
    shared: Arc<Shared>,
    dataset_id: String,
    run_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let now_idle = {
            let mut active = self.shared.active();
            if active
                .get(&self.dataset_id)
                .is_some_and(|run| run.run_id == self.run_id)
            {
                active.remove(&self.dataset_id);
            }
            active.is_empty()
        };
        if now_idle {
            self.shared.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct WorkflowSupervisor {
    engine: WorkflowEngine,
    shared: Arc<Shared>,
}

impl WorkflowSupervisor {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            shared: Arc::new(Shared {
                active: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Start `request` unless another run for the same dataset is active.
    ///
    /// This only serializes runs inside one process. Other clients are kept
    /// out by the dataset lock the run itself acquires.
    pub fn submit(&self, request: WorkflowRequest) -> Result<WorkflowHandle, SupervisorError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let dataset_id = request.dataset_id().to_string();
        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();

        {
            let mut active = self.shared.active();
            if let Some(existing) = active.get(&dataset_id) {
                return Err(SupervisorError::DatasetBusy {
                    dataset_id,
                    run_id: existing.run_id,
                    kind: existing.kind,
                });
            }
            active.insert(
                dataset_id.clone(),
                ActiveRun {
                    dataset_id: dataset_id.clone(),
                    run_id,
                    kind: request.kind(),
                    cancel: cancel.clone(),
                },
            );
        }

        let guard = SlotGuard {
            shared: self.shared.clone(),
            dataset_id,
            run_id,
        };
        Ok(self.engine.start_with(run_id, request, cancel, guard))
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self.shared.active().values().cloned().collect();
        runs.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        runs
    }

    pub fn is_active(&self, dataset_id: &str) -> bool {
        self.shared.active().contains_key(dataset_id)
    }

    /// Request cancellation of the active run for `dataset_id`
    pub fn cancel(&self, dataset_id: &str) -> bool {
        match self.shared.active().get(dataset_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every active run; returns their datasets
    pub fn cancel_all(&self) -> Vec<String> {
        let active = self.shared.active();
        let mut cancelled: Vec<String> = active
            .values()
            .map(|run| {
                run.cancel.cancel();
                run.dataset_id.clone()
            })
            .collect();
        cancelled.sort();
        cancelled
    }

    /// Stop accepting work, cancel everything, and wait up to `grace` for the
    /// runs to reach a terminal state.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shared.closed.store(true, Ordering::SeqCst);
        let cancelled = self.cancel_all();
        if !cancelled.is_empty() {
            info!(
                "Shutdown: cancelled {} active run(s), waiting up to {:?}",
                cancelled.len(),
                grace
            );
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Register before checking so a wakeup between the two is not lost
            let idle = self.shared.idle.notified();
            let unfinished: Vec<String> = self
                .active_runs()
                .into_iter()
                .map(|run| run.dataset_id)
                .collect();
            if unfinished.is_empty() {
                return ShutdownReport {
                    cancelled,
                    unfinished,
                };
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(
                    "Shutdown grace period elapsed with {} run(s) still active: {}",
                    unfinished.len(),
                    unfinished.join(", ")
                );
                return ShutdownReport {
                    cancelled,
                    unfinished,
                };
            }
        }
    }
}
