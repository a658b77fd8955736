use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::CollectError;

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError {
    /// Non-retryable error, or the last attempt's error once the budget ran out.
    Exhausted { attempts: u32, error: CollectError },
    Cancelled,
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out of attempts,
    /// or `cancel` fires. `on_retry` is called before each backoff sleep.
    pub async fn run<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: R,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollectError>>,
        R: FnMut(u32, &CollectError),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op() => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.backoff(attempt);
            warn!(attempt, delay = ?delay, error = %error, "retrying after transient error");
            on_retry(attempt, &error);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
