//! # Fixed-delay retries
//!
//! Re-invokes a fallible async operation a bounded number of times with a
//! constant pause between attempts. Used when reconnecting a session and
//! in the transport adapter.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times to try and how long to pause in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one. Never below 1.
    attempts: u32,
    /// Pause after each failed, non-final attempt
    delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Create a fixed-delay policy; `attempts` is clamped to at least one call
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Single attempt, no retries
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Begin tracking attempts for a hand-written retry loop
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            failures: 0,
        }
    }
}

/// Attempt bookkeeping for one retried operation.
///
/// Used where the operation borrows mutable state and so cannot be handed
/// to [`retry`] as a closure:
///
/// ```rust,no_run
/// # use trunk::retry::RetryPolicy;
/// # async fn op(counter: &mut u32) -> Result<(), String> { *counter += 1; Ok(()) }
/// # async fn demo() -> Result<(), String> {
/// let mut counter = 0;
/// let mut state = RetryPolicy::default().start();
/// loop {
///     match op(&mut counter).await {
///         Ok(()) => break Ok(()),
///         Err(e) => state.backoff(e, |e| tracing::warn!("{e}")).await?,
///     }
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    /// Record a failure.
    ///
    /// Returns the error back when the attempt budget is spent. Otherwise
    /// reports it through `on_error`, sleeps for the policy delay and
    /// returns `Ok(())` so the caller tries again.
    pub async fn backoff<E, C>(&mut self, error: E, on_error: C) -> Result<(), E>
    where
        C: FnOnce(&E),
    {
        self.failures += 1;
        if self.failures >= self.policy.attempts {
            return Err(error);
        }
        on_error(&error);
        if !self.policy.delay.is_zero() {
            tokio::time::sleep(self.policy.delay).await;
        }
        Ok(())
    }

    /// Failures recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Call `operation` until it succeeds or the policy runs out of attempts.
///
/// `on_error` sees every failure except the last one, which is returned
/// to the caller untouched.
pub async fn retry<T, E, F, Fut, C>(policy: &RetryPolicy, mut operation: F, mut on_error: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E),
{
    let mut state = policy.start();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => state.backoff(error, &mut on_error).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).attempts(), 1);
        assert_eq!(RetryPolicy::once().attempts(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reported = Vec::new();

        let result: Result<u32, String> = retry(
            &quick(3),
            || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("failure {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |e| reported.push(e.clone()),
        )
        .await;

        assert_eq!(assert_ok!(result), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reported, vec!["failure 1".to_string(), "failure 2".to_string()]);
    }

    #[tokio::test]
    async fn test_final_failure_not_reported() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reported = 0;

        let result: Result<(), String> = retry(
            &quick(3),
            || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            },
            |_| reported += 1,
        )
        .await;

        assert_eq!(assert_err!(result), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reported, 2);
    }

    #[tokio::test]
    async fn test_single_attempt_never_reports() {
        let mut reported = 0;
        let result: Result<(), &str> = retry(&RetryPolicy::once(), || async { Err("nope") }, |_| {
            reported += 1
        })
        .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(reported, 0);
    }

    #[tokio::test]
    async fn test_state_loop_form() {
        let mut state = quick(2).start();
        assert_ok!(state.backoff("first", |_| {}).await);
        assert_eq!(state.failures(), 1);
        assert_eq!(state.backoff("second", |_| {}).await, Err("second"));
        assert_eq!(state.failures(), 2);
    }
}
