//! Shared retry with exponential backoff, used by every sink.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// How a sink retries a failed send.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds: the wait after attempt `n` is `base^n`.
    pub backoff_base: f64,
    /// Upper bound for a single wait.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: f64, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            backoff_cap,
        }
    }

    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base.max(0.0).powi(attempt as i32);
        if !secs.is_finite() || secs >= self.backoff_cap.as_secs_f64() {
            return self.backoff_cap;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, or attempts run out.
///
/// `op` receives the 1-based attempt number. Exhaustion is reported as
/// [`Error::RetriesExhausted`] carrying the last error message.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, sink: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(sink, attempt, "Publish succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                error!(sink, attempt, error = %e, "Publish failed with non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!(sink, attempts = attempt, error = %e, "Publish failed, retries exhausted");
                return Err(Error::RetriesExhausted {
                    sink: sink.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    sink,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(5, 2.0, Duration::from_secs(10));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(10));
        assert_eq!(policy.delay_after(60), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures_with_backoff() {
        let policy = RetryPolicy::new(5, 2.0, Duration::from_secs(60));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = calls.clone();
        let result = with_retry(&policy, "test", move |attempt| {
            recorded.lock().unwrap().push(start.elapsed());
            async move {
                if attempt <= 2 {
                    Err(Error::publish("test", "unavailable"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(2));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_stops_at_max_attempts() {
        let policy = RetryPolicy::new(4, 2.0, Duration::from_secs(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = with_retry(&policy, "hook", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::publish("hook", "connection refused")) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match result {
            Err(Error::RetriesExhausted { sink, attempts, .. }) => {
                assert_eq!(sink, "hook");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(5, 2.0, Duration::from_secs(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = with_retry(&policy, "hook", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::publish_permanent("hook", "400 bad request")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Publish { retryable: false, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, 2.0, Duration::from_secs(1));
        let result = with_retry(&policy, "hook", |_| async { Ok::<_, Error>(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }
}
