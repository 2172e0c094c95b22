/// Error code registry for datagest
///
/// Error codes are organized by category:
/// - 1000-1999: Lock errors
/// - 2000-2999: Subprocess errors
/// - 3000-3999: Backend errors
/// - 4000-4999: Workflow errors
/// - 5000-5999: Configuration errors
pub struct ErrorCode;

impl ErrorCode {
    // Lock errors (1000-1999)
    pub const LOCK_HELD: u16 = 1001;
    pub const LOCK_IO: u16 = 1002;

    // Subprocess errors (2000-2999)
    pub const EXEC_TIMEOUT: u16 = 2001;

    // Backend errors (3000-3999)
    pub const BACKEND_TRANSIENT: u16 = 3001;
    pub const BACKEND_FATAL: u16 = 3002;

    // Workflow errors (4000-4999)
    pub const WORKFLOW_CANCELLED: u16 = 4001;
    pub const WORKFLOW_INVALID_REQUEST: u16 = 4002;
    pub const WORKFLOW_IO: u16 = 4003;

    // Configuration errors (5000-5999)
    pub const CONFIG_INVALID: u16 = 5001;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1001 => "Dataset is locked by another operator",
        1002 => "Shared lock path is not accessible",
        2001 => "External command exceeded its timeout",
        3001 => "Transient network failure talking to a remote",
        3002 => "Backend rejected the operation",
        4001 => "Cancelled by user",
        4002 => "Request precondition not met",
        4003 => "Local filesystem error",
        5001 => "Invalid configuration",
        _ => "Unknown error code",
    }
}
