//! Error handling utilities
//!
//! Maps errors reaching the binary boundary to a message and exit code.

use tracing::error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::error::{Classified, ErrorKind, WorkflowError};
use crate::lock::LockError;
use crate::workflow::SupervisorError;
use crate::workspace::WorkspaceError;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_LOCKED: i32 = 3;
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code for a classified failure
pub fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidRequest => EXIT_USAGE,
        ErrorKind::LockHeld => EXIT_LOCKED,
        ErrorKind::CancelledByUser => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    }
}

/// Find the classification of an error that crossed into `anyhow`
pub fn classify(error: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(e) = error.downcast_ref::<WorkflowError>() {
        return Some(e.kind());
    }
    if let Some(e) = error.downcast_ref::<LockError>() {
        return Some(e.kind());
    }
    if let Some(e) = error.downcast_ref::<ConfigError>() {
        return Some(e.kind());
    }
    if let Some(e) = error.downcast_ref::<WorkspaceError>() {
        return Some(e.kind());
    }
    if let Some(e) = error.downcast_ref::<BackendError>() {
        return Some(e.kind());
    }
    error.downcast_ref::<SupervisorError>().map(|e| e.kind())
}

/// Print the error and exit with a code derived from its kind.
///
/// `verbose >= 1` also prints the source chain.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);

    let kind = classify(&error);
    match (kind, error.downcast_ref::<WorkflowError>()) {
        // WorkflowError already carries its code in Display
        (_, Some(e)) => eprintln!("Error [E{:04}]: {}", e.kind.code(), e.message),
        (Some(kind), None) => eprintln!("Error [E{:04}]: {}", kind.code(), error),
        (None, None) => eprintln!("Error: {error}"),
    }

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(kind.map(exit_code_for).unwrap_or(EXIT_FAILURE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(ErrorKind::InvalidRequest), EXIT_USAGE);
        assert_eq!(exit_code_for(ErrorKind::LockHeld), EXIT_LOCKED);
        assert_eq!(exit_code_for(ErrorKind::CancelledByUser), EXIT_CANCELLED);
        assert_eq!(exit_code_for(ErrorKind::Timeout), EXIT_FAILURE);
    }

    #[test]
    fn test_classify_through_anyhow() {
        let error = anyhow::Error::new(WorkflowError::invalid_request("confirm first"));
        assert_eq!(classify(&error), Some(ErrorKind::InvalidRequest));

        let error = anyhow::Error::new(WorkspaceError::InvalidDatasetId("../x".into()));
        assert_eq!(classify(&error), Some(ErrorKind::InvalidRequest));

        let error = anyhow::anyhow!("plain failure");
        assert_eq!(classify(&error), None);
    }
}
