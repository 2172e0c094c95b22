//! Retry policy and executor for network-facing steps
//!
//! [`RetryPolicy::decide`] is a pure function of an [`ErrorClass`] and the
//! attempt number. [`RetryExecutor`] drives an async operation through it,
//! sleeping between attempts and recording the delays it actually used.

pub mod classify;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

pub use classify::{is_non_fast_forward, is_nothing_to_commit, is_transient_message};

/// How a single failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
    /// The step observed a cancellation signal mid-execution
    Cancelled,
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
    Cancelled,
}

/// Retry configuration for one network-facing step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles for each further attempt
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single backoff delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff after the given failed attempt (1-based):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = 1u32
            .checked_shl(exponent)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    /// Decide what to do after attempt number `attempt` failed with `class`
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        match class {
            ErrorClass::Cancelled => RetryDecision::Cancelled,
            ErrorClass::Fatal => RetryDecision::GiveUp,
            ErrorClass::Retryable if attempt >= self.max_attempts.max(1) => RetryDecision::GiveUp,
            ErrorClass::Retryable => RetryDecision::RetryAfter(self.backoff(attempt)),
        }
    }
}

/// Why a retried operation did not succeed
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancellation observed before an attempt, during backoff, or reported by the step
    Cancelled,
    /// A non-retryable failure
    Fatal { error: E, attempt: u32 },
    /// Retryable failures until the budget ran out
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => Some(error),
        }
    }
}

/// Notice passed to the caller before each backoff sleep
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub label: String,
    pub failed_attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub reason: String,
}

impl RetryNotice {
    pub fn describe(&self) -> String {
        let first_line = self
            .reason
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("network error");
        format!(
            "{} failed ({}). Retrying in {:.1}s (attempt {}/{})",
            self.label,
            first_line.trim(),
            self.delay.as_secs_f64(),
            self.failed_attempt + 1,
            self.max_attempts
        )
    }
}

/// Retry metrics for observability
#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub failed_attempts: u32,
    pub retries: Vec<(u32, Duration)>,
}

impl RetryMetrics {
    fn record_success(&mut self, attempt: u32) {
        self.total_attempts += attempt;
        self.successful_attempts += 1;
    }

    fn record_failure(&mut self, attempt: u32) {
        self.total_attempts += attempt;
        self.failed_attempts += 1;
    }

    fn record_retry(&mut self, attempt: u32, delay: Duration) {
        self.retries.push((attempt, delay));
    }
}

/// Drives an operation through a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: Arc<RwLock<RetryMetrics>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: Arc::new(RwLock::new(RetryMetrics::default())),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or cancellation is observed.
    ///
    /// `classify` is called exactly once per failure. `on_retry` is called
    /// before every backoff sleep.
    pub async fn execute<T, E, F, Fut, C, N>(
        &self,
        label: &str,
        cancel: &CancelToken,
        classify: C,
        mut on_retry: N,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        N: FnMut(&RetryNotice),
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("{} skipped: cancellation requested", label);
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    self.metrics.write().await.record_success(attempt);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = classify(&error);
            match self.policy.decide(class, attempt) {
                RetryDecision::Cancelled => {
                    info!("{} cancelled during attempt {}", label, attempt);
                    return Err(RetryError::Cancelled);
                }
                RetryDecision::GiveUp => {
                    self.metrics.write().await.record_failure(attempt);
                    if class == ErrorClass::Retryable {
                        warn!("{} failed after {} attempts: {}", label, attempt, error);
                        return Err(RetryError::Exhausted {
                            error,
                            attempts: attempt,
                        });
                    }
                    return Err(RetryError::Fatal { error, attempt });
                }
                RetryDecision::RetryAfter(delay) => {
                    let notice = RetryNotice {
                        label: label.to_string(),
                        failed_attempt: attempt,
                        max_attempts: self.policy.max_attempts,
                        delay,
                        reason: error.to_string(),
                    };
                    warn!("{}", notice.describe());
                    on_retry(&notice);

                    if !sleep_unless_cancelled(delay, cancel).await {
                        return Err(RetryError::Cancelled);
                    }
                    self.metrics.write().await.record_retry(attempt, delay);
                }
            }
        }
    }

    pub async fn metrics(&self) -> RetryMetrics {
        self.metrics.read().await.clone()
    }
}

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sleep for `delay`, waking early if cancellation is requested.
/// Returns false when cancelled.
async fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL_INTERVAL)).await;
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(750)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(8)
}
