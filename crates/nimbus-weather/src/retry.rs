//! Retry with exponential backoff and jitter.
//!
//! Only transient provider failures are retried:
//! - 429 Too Many Requests
//! - 5xx server errors
//!
//! Everything else propagates on the first failure, including
//! cancellation, authentication (401) and not-found (404).

use std::future::Future;
use std::time::Duration;

use crate::error::FetchError;

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Jitter multiplier bounds applied to every delay
const JITTER_MIN: f64 = 0.85;
const JITTER_MAX: f64 = 1.15;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub retries: u32,
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay_ms: u64) -> Self {
        Self {
            retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, 0)
    }

    /// Delay before retry `attempt` (0-based) for a given jitter multiplier:
    /// `base_delay * 2^attempt * jitter`.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u64.saturating_pow(attempt) as f64;
        self.base_delay.mul_f64(factor * jitter)
    }

    /// Delay before retry `attempt` with a jitter drawn from `[0.85, 1.15]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = JITTER_MIN + fastrand::f64() * (JITTER_MAX - JITTER_MIN);
        self.backoff(attempt, jitter)
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

pub fn retry_decision(error: &FetchError) -> RetryDecision {
    if error.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::NoRetry
    }
}

/// Run `operation`, retrying transient failures per `policy`.
///
/// When retries run out the last failure is returned unchanged.
///
/// # Example
/// ```ignore
/// let current = with_retry(&RetryPolicy::default(), || client.fetch(kind, &query)).await?;
/// ```
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Request succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if retry_decision(&error) == RetryDecision::NoRetry {
            tracing::debug!("Non-retryable error: {}", error);
            return Err(error);
        }

        if attempt >= policy.retries {
            tracing::error!("All {} attempts exhausted: {}", attempt + 1, error);
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            "Retryable error on attempt {} of {}, waiting {:?}: {}",
            attempt + 1,
            policy.retries + 1,
            delay,
            error
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting(
        calls: &Arc<AtomicU32>,
        status: u16,
    ) -> impl FnMut() -> std::future::Ready<Result<(), FetchError>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(FetchError::http(status, format!("HTTP {}", status))))
        }
    }

    #[test]
    fn test_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, 100);

        assert_eq!(policy.backoff(0, 1.0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1, 1.0), Duration::from_millis(200));
        assert_eq!(policy.backoff(2, 1.0), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(3, 1000);
        for _ in 0..50 {
            for attempt in 0..3 {
                let base = 1000.0 * 2_f64.powi(attempt as i32);
                let delay_ms = policy.delay_for_attempt(attempt).as_secs_f64() * 1000.0;
                assert!(delay_ms >= base * 0.85 - 1.0, "attempt={} delay_ms={}", attempt, delay_ms);
                assert!(delay_ms <= base * 1.15 + 1.0, "attempt={} delay_ms={}", attempt, delay_ms);
            }
        }
    }

    #[test]
    fn test_delays_grow_even_with_worst_jitter() {
        let policy = RetryPolicy::default();
        // Smallest delay of attempt n+1 still beats the largest of attempt n
        for attempt in 0..4 {
            assert!(policy.backoff(attempt + 1, JITTER_MIN) > policy.backoff(attempt, JITTER_MAX));
        }
    }

    #[test]
    fn test_retry_decisions() {
        assert_eq!(retry_decision(&FetchError::http(500, "")), RetryDecision::Retry);
        assert_eq!(retry_decision(&FetchError::http(503, "")), RetryDecision::Retry);
        assert_eq!(retry_decision(&FetchError::http(429, "")), RetryDecision::Retry);
        assert_eq!(retry_decision(&FetchError::http(401, "")), RetryDecision::NoRetry);
        assert_eq!(retry_decision(&FetchError::http(404, "")), RetryDecision::NoRetry);
        assert_eq!(retry_decision(&FetchError::Cancelled), RetryDecision::NoRetry);
        assert_eq!(
            retry_decision(&FetchError::Network("reset".into())),
            RetryDecision::NoRetry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_attempted_three_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&RetryPolicy::default(), counting(&calls, 500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result, Err(FetchError::http(500, "HTTP 500")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_attempted_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&RetryPolicy::default(), counting(&calls, 404)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().status(), Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(FetchError::Cancelled))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result, Err(FetchError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();

        let result = with_retry(&RetryPolicy::default(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n == 0 {
                Err(FetchError::http(429, "HTTP 429"))
            } else {
                Ok("sunny")
            })
        })
        .await;

        assert_eq!(result, Ok("sunny"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(425) && waited <= Duration::from_millis(576));
    }
}
