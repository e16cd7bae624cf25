//! Bounded retry for transient store failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::StoreError;

/// Default number of attempts, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the second attempt in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;
/// Default upper bound on a single delay in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;

/// Exponential backoff policy applied at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new().with_max_attempts(1)
    }

    /// Sets the attempt budget. Zero is treated as one.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = if attempts == 0 { 1 } else { attempts };
        self
    }

    /// Sets the initial and maximum backoff.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before attempt `attempt + 1`, counting from one.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last error if it is not transient or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_after(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}
