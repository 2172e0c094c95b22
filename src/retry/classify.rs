//! Message-based classification of backend failures

/// Markers that identify a transient transport problem in backend output
const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "connection reset",
    "connection refused",
    "connection aborted",
    "could not resolve host",
    "unable to access",
    "transport endpoint",
    "broken pipe",
    "resource busy",
    "name or service not known",
    "no route to host",
    "stale file handle",
];

/// Markers that identify a rejection no retry can fix
const FATAL_MARKERS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "not a git repository",
    "repository corrupt",
    "object file is empty",
    "bad object",
    "could not read username",
];

/// Returns true when backend output looks like a transient network failure.
///
/// Fatal markers win over transient ones: "permission denied (network share)"
/// is an access problem, not a flaky link.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return false;
    }
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Returns true when the remote refused a push because it moved ahead
pub fn is_non_fast_forward(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("non-fast-forward")
        || lowered.contains("failed to push some refs")
        || lowered.contains("fetch first")
}

/// Returns true when a commit attempt found nothing staged
pub fn is_nothing_to_commit(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("nothing to commit") || lowered.contains("no changes added to commit")
}
