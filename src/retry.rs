//! Bounded retry with jittered backoff
//!
//! Coordination-store round trips can fail transiently on connection loss.
//! Those failures are retried a bounded number of times; everything else
//! (session expiry, protocol errors) is surfaced immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Retry policy for transient coordination-store failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), exponential with jitter
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        capped.mul_f64(jitter)
    }
}

/// Run `op`, retrying transient failures according to `policy`.
///
/// Only errors for which [`Error::is_retryable`] holds are retried. When the
/// attempt budget is exhausted the last error is wrapped in
/// [`Error::RetriesExhausted`] so callers can tell a persistent outage from a
/// single transient blip.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Transient failure during {} (attempt {}/{}): {}; retrying in {:?}",
                    operation,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retries(&fast_policy(), "create node", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::ConnectionLost("store".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries(&fast_policy(), "create node", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::SessionExpired) }
        })
        .await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let result: Result<()> = with_retries(&fast_policy(), "list candidates", || async {
            Err(Error::ConnectionTimeout("store".into()))
        })
        .await;

        match result {
            Err(Error::RetriesExhausted {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "list candidates");
                assert_eq!(attempts, 3);
                assert!(source.is_retryable());
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }
}
