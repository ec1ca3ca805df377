//! Time-bounded retry scheduling for remote browser actions.
//!
//! The remote browser is latency-variable and transiently unreliable, so
//! risky steps run under an outer deadline with a per-attempt timeout and
//! a fixed backoff between failed attempts.

use crate::error::{EngineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Fixed pause between failed attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Bounds for [`run_bounded`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total budget for the whole retry loop. Attempts still in flight
    /// when it elapses are abandoned.
    pub outer_deadline: Duration,
    /// Budget for a single attempt.
    pub per_attempt_timeout: Duration,
    /// On outer expiry: `false` gives up quietly with `Ok(())`, `true`
    /// surfaces the last attempt error (or `DeadlineExceeded`).
    pub propagate_timeout_as_error: bool,
}

impl RetryPolicy {
    pub fn new(outer_deadline: Duration, per_attempt_timeout: Duration) -> Self {
        Self {
            outer_deadline,
            per_attempt_timeout,
            propagate_timeout_as_error: true,
        }
    }

    /// Outer expiry is treated as "best effort, give up quietly".
    pub fn best_effort(mut self) -> Self {
        self.propagate_timeout_as_error = false;
        self
    }
}

/// Runs `action` repeatedly until it succeeds or `policy.outer_deadline`
/// elapses. Each attempt is bounded by `policy.per_attempt_timeout`,
/// capped by the remaining outer budget; failed attempts are separated by
/// a fixed backoff.
///
/// The scheduler does not roll back partial remote side effects. Actions
/// must be idempotent, or the caller must re-establish page state before
/// retrying.
pub async fn run_bounded<F, Fut>(policy: &RetryPolicy, mut action: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let deadline = Instant::now() + policy.outer_deadline;
    let mut last_error: Option<EngineError> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let attempt_budget = policy.per_attempt_timeout.min(remaining);
        match timeout(attempt_budget, action()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => {
                if last_error.is_none() {
                    last_error = Some(EngineError::DeadlineExceeded);
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        sleep(RETRY_BACKOFF.min(remaining)).await;
    }

    if !policy.propagate_timeout_as_error {
        return Ok(());
    }
    Err(last_error.unwrap_or(EngineError::DeadlineExceeded))
}

/// Runs exactly one attempt of `action` bounded by `budget`. Used where
/// retrying is unsafe, e.g. a click that must not be repeated.
pub async fn run_once<F, Fut>(budget: Duration, action: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match timeout(budget, action()).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::DeadlineExceeded),
    }
}
