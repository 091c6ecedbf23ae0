use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AzureError;

/// Exponential backoff policy for retried service calls.
///
/// The delay for attempt `n` is `base * multiplier^n`, clamped to `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Factor applied on each successive attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given retry count and base delay, doubling
    /// on each attempt and clamped to one minute.
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            base,
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }

    /// Default policy for queue sends: 3 retries, 5 seconds base.
    pub fn queue_default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }

    /// Default policy for Event Grid batch publishing: 3 retries, 3 seconds
    /// base.
    pub fn event_grid_default() -> Self {
        Self::new(3, Duration::from_secs(3))
    }

    /// Compute the delay for the given zero-based `attempt` number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // `attempt` is a small retry count, so the cast cannot wrap.
        #[allow(clippy::cast_possible_wrap)]
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Run `f`, retrying on retryable errors with backoff from `policy`.
///
/// Each failed attempt that still has retries left logs a warning and sleeps
/// for the prescribed delay. Non-retryable errors and the final attempt's
/// error are returned as-is.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, AzureError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AzureError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %err,
                    "retryable error, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_secs(3));
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for(2), Duration::from_secs(12));
    }

    #[test]
    fn delays_clamp_to_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            base: Duration::from_secs(5),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn service_defaults() {
        let queue = RetryPolicy::queue_default();
        assert_eq!(queue.max_retries, 3);
        assert_eq!(queue.base, Duration::from_secs(5));

        let grid = RetryPolicy::event_grid_default();
        assert_eq!(grid.max_retries, 3);
        assert_eq!(grid.base, Duration::from_secs(3));
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, AzureError>(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AzureError::Http {
                        status: 503,
                        message: "unavailable".into(),
                    })
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AzureError::Http {
                    status: 400,
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(AzureError::Http { status: 400, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AzureError::Http {
                    status: 429,
                    message: "throttled".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        // 1 initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
