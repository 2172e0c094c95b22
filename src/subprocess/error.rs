use std::time::Duration;

use crate::error::{Classified, ErrorKind};
use crate::retry::is_transient_message;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {}s: {command}", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("{message}")]
    NonZeroExit {
        command: String,
        code: i32,
        message: String,
    },

    #[error("Command cancelled: {command}")]
    Cancelled { command: String },

    #[error("I/O error running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// Backend output attached to the failure, if any
    pub fn output_message(&self) -> Option<&str> {
        match self {
            ProcessError::NonZeroExit { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}

impl Classified for ProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Timeout { .. } => ErrorKind::Timeout,
            ProcessError::Cancelled { .. } => ErrorKind::CancelledByUser,
            ProcessError::NonZeroExit { message, .. } if is_transient_message(message) => {
                ErrorKind::TransientNetwork
            }
            ProcessError::NonZeroExit { .. }
            | ProcessError::CommandNotFound(_)
            | ProcessError::MockExpectationNotMet(_) => ErrorKind::FatalBackend,
            ProcessError::SpawnFailed { .. } | ProcessError::Io { .. } => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_command() {
        let err = ProcessError::Timeout {
            command: "git push origin main".to_string(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(
            err.to_string(),
            "Command timed out after 300s: git push origin main"
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_non_zero_exit_classification() {
        let transient = ProcessError::NonZeroExit {
            command: "git push".to_string(),
            code: 128,
            message: "fatal: unable to access remote: Connection reset by peer".to_string(),
        };
        let fatal = ProcessError::NonZeroExit {
            command: "git push".to_string(),
            code: 128,
            message: "fatal: Authentication failed".to_string(),
        };
        assert_eq!(transient.kind(), ErrorKind::TransientNetwork);
        assert_eq!(fatal.kind(), ErrorKind::FatalBackend);
    }

    #[test]
    fn test_cancelled_kind() {
        let err = ProcessError::Cancelled {
            command: "dvc pull".to_string(),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), ErrorKind::CancelledByUser);
    }
}
