//! Shared error taxonomy
//!
//! Every failure is classified exactly once into an [`ErrorKind`] at the point
//! where it is caught. Module errors (`LockError`, `ProcessError`,
//! `BackendError`, ...) implement [`Classified`] so the workflow engine can
//! build the terminal [`WorkflowError`] without re-deriving the cause.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Classification of every failure the engine can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected contention: another client holds the dataset lock
    LockHeld,
    /// The shared lock path could not be read or written
    LockIo,
    /// A subprocess exceeded its wall-clock bound
    Timeout,
    /// Remote temporarily unreachable; retryable
    TransientNetwork,
    /// Authentication, corruption, rejected operation; never retried
    FatalBackend,
    /// Operator cancellation, distinct from failure
    CancelledByUser,
    /// Caller-side precondition not met (missing confirmation, empty source, ...)
    InvalidRequest,
    /// Local filesystem failure outside the lock path
    Io,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::LockHeld => ErrorCode::LOCK_HELD,
            ErrorKind::LockIo => ErrorCode::LOCK_IO,
            ErrorKind::Timeout => ErrorCode::EXEC_TIMEOUT,
            ErrorKind::TransientNetwork => ErrorCode::BACKEND_TRANSIENT,
            ErrorKind::FatalBackend => ErrorCode::BACKEND_FATAL,
            ErrorKind::CancelledByUser => ErrorCode::WORKFLOW_CANCELLED,
            ErrorKind::InvalidRequest => ErrorCode::WORKFLOW_INVALID_REQUEST,
            ErrorKind::Io => ErrorCode::WORKFLOW_IO,
        }
    }

    pub fn is_cancellation(self) -> bool {
        matches!(self, ErrorKind::CancelledByUser)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::LockHeld => "lock held",
            ErrorKind::LockIo => "lock I/O error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientNetwork => "transient network error",
            ErrorKind::FatalBackend => "backend error",
            ErrorKind::CancelledByUser => "cancelled",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(label)
    }
}

/// Errors that know which [`ErrorKind`] they belong to
pub trait Classified: std::error::Error {
    fn kind(&self) -> ErrorKind;
}

/// Terminal error carried by workflow events
///
/// Holds enough detail (kind, message, failing step) for the caller to
/// explain the outcome without inspecting the underlying source error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[E{:04}] {}", .kind.code(), .message)]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub message: String,
    pub step: Option<String>,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
        }
    }

    pub fn from_classified<E: Classified>(err: &E) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::CancelledByUser, "Cancelled by user.")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

impl Classified for WorkflowError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = WorkflowError::new(ErrorKind::LockHeld, "Dataset locked by alice");
        assert_eq!(err.to_string(), "[E1001] Dataset locked by alice");
    }

    #[test]
    fn test_at_step_records_step() {
        let err = WorkflowError::io("disk full").at_step("copy files");
        assert_eq!(err.step.as_deref(), Some("copy files"));
        assert_eq!(err.kind, ErrorKind::Io);
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        assert!(WorkflowError::cancelled().kind.is_cancellation());
        assert!(!ErrorKind::Timeout.is_cancellation());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TransientNetwork).unwrap();
        assert_eq!(json, "\"transient_network\"");
    }
}
