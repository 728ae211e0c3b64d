#[cfg(test)]
mod tests;

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::StorageConfig;
use crate::{Result, StoreError};

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Timeout and bounded exponential backoff for storage and vector backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            operation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            operation_timeout: config.operation_timeout(),
            ..Self::default()
        }
    }

    /// Single attempt, default timeout
    #[inline]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Runs `operation` until it succeeds, fails permanently or retries run out.
    /// A timed-out attempt counts as a transient failure.
    #[inline]
    pub async fn run<T, F, Fut>(&self, operation: &str, target: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!("{} on {}: attempt {}/{}", operation, target, attempt, attempts);

            let outcome = match tokio::time::timeout(self.operation_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::transient(
                    operation,
                    target,
                    format!("timed out after {:?}", self.operation_timeout),
                )),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} on {} succeeded on attempt {}", operation, target, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Transient failure in {} on {}: {}, attempt {}/{}",
                        operation, target, e, attempt, attempts
                    );
                    last_error = Some(e);

                    if attempt < attempts {
                        let delay = self.delay_for(attempt);
                        debug!("Waiting {:?} before retry", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        error!("All retry attempts failed for {} on {}", operation, target);
        Err(last_error.unwrap_or_else(|| {
            StoreError::transient(operation, target, "operation failed after retries")
        }))
    }
}
