//! Store retry configuration for the barrier kernel.

use serde::Deserialize;
use std::time::Duration;

use crate::store::retry::{
    RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS,
};

/// Retry of transient store failures.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    /// Attempts including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff in milliseconds (default: 50)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds (default: 1000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetrySettings {
    /// Retry policy for the store.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            )
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
