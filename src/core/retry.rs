//! Generic retry with exponential backoff for transient failures.
//!
//! Only the delivery adapter consumes this — engines never retry a send
//! themselves, they see a single success or failure per attempt.

use std::time::Duration;

/// Error types opt into retrying by implementing this.
pub trait Retryable {
    /// Whether another attempt can possibly succeed.
    fn is_retryable(&self) -> bool;

    /// Server-mandated wait before the next attempt (e.g. flood control),
    /// overriding the computed backoff when present.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Backoff policy: `max_attempts` tries total, delay doubling from
/// `initial_delay` up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Short policy for tests and latency-sensitive paths.
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Outcome of a retried operation, with the attempt count for logging.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the
/// attempt budget is exhausted.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> RetryResult<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(err) => {
                if !err.is_retryable() || attempts >= config.max_attempts {
                    return RetryResult {
                        result: Err(err),
                        attempts,
                    };
                }
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| config.delay_for_attempt(attempts));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[tokio::test]
    async fn immediate_success_takes_one_attempt() {
        let config = RetryConfig::quick();
        let result = retry(&config, || async { Ok::<i32, TestError>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let config = RetryConfig::quick().initial_delay(Duration::from_millis(1));
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry(&config, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError { retryable: true })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let config = RetryConfig::quick();
        let result = retry(&config, || async {
            Err::<i32, _>(TestError { retryable: false })
        })
        .await;
        assert!(!result.is_ok());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let config = RetryConfig::quick()
            .max_attempts(4)
            .initial_delay(Duration::from_millis(1));
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry(&config, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError { retryable: true })
            }
        })
        .await;

        assert!(!result.is_ok());
        assert_eq!(result.attempts, 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
