//! Retry with exponential backoff for transient failures.
//!
//! A [`RetryPolicy`] makes exactly `retries` attempts of an async operation.
//! After a failed attempt (except the last), the caller sleeps for
//! `min_timeout * factor^attempt` before trying again, capped at
//! [`MAX_BACKOFF`]. The error from the final attempt is returned unchanged.

use std::future::Future;
use std::time::Duration;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts (not additional attempts after the first)
    pub retries: u32,
    /// Base delay before the first retry
    pub min_timeout: Duration,
    /// Backoff multiplier applied per attempt
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            min_timeout: Duration::from_millis(500),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given zero-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = millis.min(MAX_BACKOFF.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run an operation under a retry policy.
///
/// `operation` is invoked with the zero-based attempt index. Returns the
/// first success, or the error from the last attempt once the policy is
/// exhausted.
pub async fn retry_with_policy<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_observed(policy, &mut operation, |_, _| {}).await
}

/// Run an operation under a retry policy, notifying `observer` of each
/// failed attempt before the backoff sleep.
pub async fn retry_observed<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    operation: &mut F,
    mut observer: O,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(u32, &E),
{
    let attempts = policy.retries.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                observer(attempt, &err);
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off before retry"
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
    use std::sync::Arc;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            min_timeout: Duration::from_millis(1),
            factor: 2.0,
        }
    }

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let policy = RetryPolicy {
            retries: 5,
            min_timeout: Duration::from_millis(100),
            factor: 2.0,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy {
            retries: 20,
            min_timeout: Duration::from_secs(10),
            factor: 3.0,
        };
        assert_eq!(policy.backoff_delay(10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<u32, &str> = retry_with_policy(&fast_policy(3), |_| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<&str, &str> = retry_with_policy(&fast_policy(3), |_| {
            let calls = Arc::clone(&calls2);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient")
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<(), String> = retry_with_policy(&fast_policy(3), |attempt| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {attempt}"))
            }
        })
        .await;

        // Exactly `retries` attempts, and the final error surfaces
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "failure 2");
    }

    #[tokio::test]
    async fn test_observer_sees_every_failure() {
        let mut observed = Vec::new();
        let mut op = |attempt: u32| async move { Err::<(), u32>(attempt * 10) };

        let result = retry_observed(&fast_policy(3), &mut op, |attempt, err| {
            observed.push((attempt, *err));
        })
        .await;

        assert!(result.is_err());
        assert_eq!(observed, vec![(0, 0), (1, 10), (2, 20)]);
    }

    #[tokio::test]
    async fn test_zero_retries_still_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<(), &str> = retry_with_policy(&fast_policy(0), |_| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
