//! Run lifecycle: kinds, states and transition rules

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::plan::Step;
use crate::cancel::CancelToken;
use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Import,
    Publish,
    FetchLatest,
    RestoreVersion,
    ReturnToLatest,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowKind::Import => "import",
            WorkflowKind::Publish => "publish",
            WorkflowKind::FetchLatest => "fetch-latest",
            WorkflowKind::RestoreVersion => "restore-version",
            WorkflowKind::ReturnToLatest => "return-to-latest",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid workflow transition from {from} to {to}")]
pub struct TransitionError {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// Pending -> Running -> {Completed, Failed, Cancelled}. A run may also be
/// failed or cancelled before it starts. Nothing leaves a terminal state.
pub fn validate_transition(from: WorkflowState, to: WorkflowState) -> Result<(), TransitionError> {
    use WorkflowState::*;

    let valid = match (from, to) {
        (Pending, Running) => true,
        (Pending, Failed) | (Pending, Cancelled) => true,
        (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// One invocation of a workflow against one dataset, owned by the engine
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub kind: WorkflowKind,
    pub dataset_id: String,
    pub state: WorkflowState,
    pub cancel: CancelToken,
    pub current_step: Option<Step>,
    pub completed_steps: Vec<Step>,
    pub last_error: Option<WorkflowError>,
}

impl WorkflowRun {
    pub fn new(run_id: Uuid, kind: WorkflowKind, dataset_id: &str, cancel: CancelToken) -> Self {
        Self {
            run_id,
            kind,
            dataset_id: dataset_id.to_string(),
            state: WorkflowState::Pending,
            cancel,
            current_step: None,
            completed_steps: Vec::new(),
            last_error: None,
        }
    }

    pub fn transition(&mut self, to: WorkflowState) -> Result<(), TransitionError> {
        validate_transition(self.state, to)?;
        tracing::debug!(
            "Run {} ({} {}): {} -> {}",
            self.run_id,
            self.kind,
            self.dataset_id,
            self.state,
            to
        );
        self.state = to;
        Ok(())
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowState::*;

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(Pending, Running).is_ok());
        assert!(validate_transition(Running, Completed).is_ok());
        assert!(validate_transition(Running, Failed).is_ok());
        assert!(validate_transition(Running, Cancelled).is_ok());
        assert!(validate_transition(Pending, Failed).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(validate_transition(terminal, next).is_err());
            }
        }
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_run_transition_updates_state() {
        let mut run = WorkflowRun::new(Uuid::new_v4(), WorkflowKind::Import, "cam1", CancelToken::new());
        run.transition(Running).unwrap();
        run.transition(Completed).unwrap();
        let err = run.transition(Running).unwrap_err();
        assert_eq!(err.to_string(), "Invalid workflow transition from completed to running");
        assert_eq!(run.state, Completed);
    }
}
