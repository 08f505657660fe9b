//! Bounded exponential backoff with per-call deadlines.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::StoreSide;
use crate::{Error, Result};

/// Retry policy: `delay(n) = min(base * 2^n, max)`, at most `max_retries`
/// retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any one delay
    pub max_delay: Duration,
    /// Deadline for one call
    pub call_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            call_timeout: config.call_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total attempts (first try plus retries).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    /// A call exceeding the deadline counts as a transient failure.
    ///
    /// # Errors
    ///
    /// The last error once retries are exhausted, or the first non-transient
    /// error.
    pub async fn run<T, F, Fut>(&self, store: StoreSide, label: &str, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(Error::transient(store, format!("{label} timed out"))),
            };
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(store = %store, label, attempt, "Store call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(store = %store, label, attempt, ?delay, error = %e, "Transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
