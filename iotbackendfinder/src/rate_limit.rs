//! Rate limiting for remote API requests
//!
//! Provides a token bucket limiter, constructed once per fetcher, and a retry
//! helper applying the configured backoff strategy.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// A token bucket rate limiter for controlling request rates
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens available in the bucket
    tokens: f64,
    /// Maximum tokens (bucket capacity)
    max_tokens: f64,
    /// Tokens added per second (refill rate)
    refill_rate: f64,
    /// Last time tokens were updated
    last_update: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_second` with a bucket of `burst` tokens.
    /// Both values are clamped to at least 1.
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let max_tokens = burst.max(1) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: requests_per_second.max(1) as f64,
            last_update: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Try to acquire a token, returning time to wait if not available
    pub fn try_acquire(&mut self) -> Option<Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let wait_secs = (1.0 - self.tokens) / self.refill_rate;
            Some(Duration::from_secs_f64(wait_secs))
        }
    }

    /// Acquire a token, waiting if necessary
    pub async fn acquire(&mut self) {
        loop {
            match self.try_acquire() {
                None => return,
                Some(wait_duration) => {
                    debug!("Rate limiter waiting {:?} for token", wait_duration);
                    sleep(wait_duration).await;
                }
            }
        }
    }
}

/// Thread-safe rate limiter wrapper
#[derive(Debug, Clone)]
pub struct SharedRateLimiter {
    inner: Arc<Mutex<RateLimiter>>,
}

impl SharedRateLimiter {
    /// Single-token bucket: requests are spaced at least `1 / requests_per_second` apart
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_burst(requests_per_second, 1)
    }

    pub fn with_burst(requests_per_second: u32, burst: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiter::new(requests_per_second, burst))),
        }
    }

    /// Acquire a token, waiting if necessary
    pub async fn acquire(&self) {
        let mut limiter = self.inner.lock().await;
        limiter.acquire().await;
    }
}

/// An operation that failed on its last attempt
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub error: E,
    /// Attempts made, including the first
    pub attempts: u32,
    /// False when the error was not retryable and no retry was made
    pub retried: bool,
}

/// Retry helper with configurable backoff
pub struct RetryHelper {
    config: RateLimitConfig,
}

impl RetryHelper {
    /// Create a new retry helper from config
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Execute an async operation, retrying errors for which `retryable` holds.
    /// Non-retryable errors are returned after the first attempt.
    pub async fn with_retry<T, E, F, Fut, R>(&self, mut operation: F, retryable: R) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !retryable(&e) => {
                    return Err(RetryExhausted {
                        error: e,
                        attempts: attempt,
                        retried: false,
                    });
                }
                Err(e) => {
                    if attempt > self.config.max_retries {
                        warn!("All {} retry attempts exhausted, giving up: {}", self.config.max_retries, e);
                        return Err(RetryExhausted {
                            error: e,
                            attempts: attempt,
                            retried: true,
                        });
                    }

                    let delay = self.config.calculate_backoff_delay(attempt);
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?} with {:?} backoff",
                        attempt, e, delay, self.config.backoff_strategy
                    );

                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 1000,
            backoff_strategy: BackoffStrategy::Linear,
            max_retries,
            backoff_base_delay_ms: 1,
            backoff_max_delay_ms: 5,
        }
    }

    #[test]
    fn test_single_token_bucket() {
        let mut limiter = RateLimiter::new(10, 1);
        assert!(limiter.try_acquire().is_none());
        let wait = limiter.try_acquire().expect("second request must wait");
        assert!(wait <= Duration::from_millis(100));
        assert_eq!(limiter.refill_rate, 10.0);
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let mut limiter = RateLimiter::new(0, 0);
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.refill_rate, 1.0);
        assert_eq!(limiter.max_tokens, 1.0);
    }

    #[tokio::test]
    async fn test_shared_rate_limiter_spaces_requests() {
        let limiter = SharedRateLimiter::new(50);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two waits of ~20ms each after the initial token
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let helper = RetryHelper::new(&fast_config(3));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, RetryExhausted<String>> = helper
            .with_retry(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let helper = RetryHelper::new(&fast_config(2));
        let result: Result<(), _> = helper
            .with_retry(|| async { Err::<(), _>("down".to_string()) }, |_| true)
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.retried);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let helper = RetryHelper::new(&fast_config(5));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = helper
            .with_retry(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("quota".to_string())
                },
                |e: &String| e != "quota",
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.retried);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
