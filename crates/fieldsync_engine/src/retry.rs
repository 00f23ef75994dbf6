//! Bounded retry with backoff, per-call timeout and cancellation.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
///
/// Each attempt is bounded by `timeout`. Cancellation is observed both
/// during an attempt and during backoff sleeps and yields
/// [`SyncError::Cancelled`]. When the budget runs out the last error is
/// returned.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    timeout: Duration,
    cancel: &CancellationToken,
    op: &str,
    mut call: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut last_error = SyncError::Timeout;

    for attempt in 0..attempts {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(op, attempt, delay_ms = delay.as_millis(), "backing off");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SyncError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            outcome = tokio::time::timeout(timeout, call()) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => {
                if attempt > 0 {
                    debug!(op, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) if err.is_retryable() => {
                warn!(op, attempt, error = %err, "retryable failure");
                last_error = err;
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(op, attempt, timeout_ms = timeout.as_millis(), "call timed out");
                last_error = SyncError::Timeout;
            }
        }
    }

    warn!(op, attempts, error = %last_error, "retry budget exhausted");
    Err(last_error)
}
