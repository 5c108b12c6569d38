//! Timeouts and retry with exponential backoff for external calls.
//!
//! # Policy
//!
//! - Every call is bounded by `call_timeout`; exceeding it yields the error type's timeout variant.
//! - Backoff: `initial_delay * 2^step`, capped at `max_delay`, then down-jittered by up to
//!   `jitter_factor` (multiplier in `[1 - jitter_factor, 1.0]`).
//! - [`CallClass::Read`] calls (idempotent reads) retry transient failures and timeouts.
//! - [`CallClass::Write`] calls retry only the transient (connection-level) class. A timed-out
//!   write may have been applied, and semantic rejections are never retried.
//! - Cancellation is observed before each attempt and during backoff sleeps.

use crate::context::CallContext;
use crate::constants::{DEFAULT_CALL_TIMEOUT, DEFAULT_RETRY_MAX_ATTEMPTS};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Classification hooks the retry loop needs from an error type.
pub trait Retryable: Sized {
    /// Connection-level or overload failure that is safe to retry.
    fn is_transient(&self) -> bool;

    /// The call exceeded its deadline.
    fn is_timeout(&self) -> bool;

    /// Build the timeout error for `operation`.
    fn timed_out(operation: &'static str, after: Duration) -> Self;

    /// Build the error returned when the caller cancelled.
    fn cancelled(operation: &'static str) -> Self;
}

/// Whether an operation is an idempotent read or a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallClass {
    Read,
    Write,
}

impl CallClass {
    fn should_retry<E: Retryable>(&self, err: &E) -> bool {
        match self {
            CallClass::Read => err.is_transient() || err.is_timeout(),
            CallClass::Write => err.is_transient(),
        }
    }
}

/// Timeout and retry configuration shared by all external clients.
#[derive(Clone, Debug)]
pub struct CallPolicy {
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
    /// Total attempts, initial call included.
    pub max_attempts: u32,
    /// Initial backoff delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter_factor: 0.25,
        }
    }
}

impl CallPolicy {
    /// A policy that never retries; useful in tests.
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate the delay before retry number `backoff_step` (0 before the first retry).
    #[must_use]
    pub fn backoff_delay(&self, backoff_step: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step.min(30) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 - rand::random::<f64>() * self.jitter_factor.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `call` under `policy`, retrying according to `class`.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or the error is not retryable for
/// `class`, the timeout error if the final attempt exceeded `call_timeout`, or the cancellation
/// error if `ctx` was cancelled.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &CallPolicy,
    class: CallClass,
    operation: &'static str,
    ctx: &CallContext,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(E::cancelled(operation)),
            res = tokio::time::timeout(policy.call_timeout, call()) => match res {
                Ok(inner) => inner,
                Err(_) => Err(E::timed_out(operation, policy.call_timeout)),
            },
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= max_attempts || !class.should_retry(&err) {
            return Err(err);
        }

        let delay = policy.backoff_delay(attempt - 1);
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            correlation_id = %ctx.correlation_id,
            error = %err,
            "retrying external call"
        );

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(E::cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Semantic,
        Timeout,
        Cancelled,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Transient)
        }
        fn is_timeout(&self) -> bool {
            matches!(self, TestError::Timeout)
        }
        fn timed_out(_: &'static str, _: Duration) -> Self {
            TestError::Timeout
        }
        fn cancelled(_: &'static str) -> Self {
            TestError::Cancelled
        }
    }

    fn fast_policy() -> CallPolicy {
        CallPolicy {
            call_timeout: Duration::from_millis(100),
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_factor: 0.25,
        }
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let policy = CallPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter_factor: 0.0,
            ..CallPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_jitter_only_reduces() {
        let policy = CallPolicy {
            initial_delay: Duration::from_millis(100),
            jitter_factor: 0.25,
            ..CallPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.backoff_delay(0);
            assert!(d <= Duration::from_millis(100));
            assert!(d >= Duration::from_millis(75));
        }
    }

    #[tokio::test]
    async fn test_transient_read_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, TestError> = call_with_retry(
            &fast_policy(),
            CallClass::Read,
            "test",
            &CallContext::detached(),
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), TestError> = call_with_retry(
            &fast_policy(),
            CallClass::Read,
            "test",
            &CallContext::detached(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Semantic) }
            },
        )
        .await;
        assert_eq!(result, Err(TestError::Semantic));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), TestError> = call_with_retry(
            &fast_policy(),
            CallClass::Write,
            "test",
            &CallContext::detached(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;
        assert_eq!(result, Err(TestError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), TestError> = call_with_retry(
            &fast_policy(),
            CallClass::Read,
            "test",
            &CallContext::detached(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;
        assert_eq!(result, Err(TestError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let ctx = CallContext::detached();
        ctx.cancel.cancel();
        let result: Result<(), TestError> = call_with_retry(
            &fast_policy(),
            CallClass::Read,
            "test",
            &ctx,
            || async { Ok(()) },
        )
        .await;
        assert_eq!(result, Err(TestError::Cancelled));
    }
}
