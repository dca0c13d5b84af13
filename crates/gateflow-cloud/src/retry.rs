//! Retry with bounded exponential backoff

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
///
/// Only [`CloudError::Transient`] is retried. The surfaced transient error
/// carries the number of attempts made.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(CloudError::Transient {
                resource, message, ..
            }) => {
                if attempt >= max_attempts {
                    warn!(operation, attempt, %resource, "Giving up after transient errors");
                    return Err(CloudError::Transient {
                        resource,
                        message,
                        attempts: attempt,
                    });
                }
                let delay = config.delay_for_attempt(attempt - 1);
                debug!(
                    operation,
                    attempt,
                    %resource,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, retrying: {}",
                    message
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
