//! Named-lock configuration for the barrier kernel.

use serde::Deserialize;
use std::time::Duration;

use crate::store::LockTimeouts;

/// Timeouts of the barrier merge lock.
#[derive(Debug, Deserialize, Clone)]
pub struct LockingSettings {
    /// How long an upsert waits for the lock, in milliseconds (default: 10000)
    #[serde(default = "default_wait_ms")]
    pub upsert_wait_ms: u64,

    /// Lease length of the lock, in milliseconds (default: 30000)
    #[serde(default = "default_hold_ms")]
    pub upsert_hold_ms: u64,

    /// Delay between acquisition attempts, in milliseconds (default: 25)
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for LockingSettings {
    fn default() -> Self {
        Self {
            upsert_wait_ms: default_wait_ms(),
            upsert_hold_ms: default_hold_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

impl LockingSettings {
    /// Wait and hold durations for the merge lock.
    #[must_use]
    pub fn upsert_timeouts(&self) -> LockTimeouts {
        LockTimeouts {
            wait: Duration::from_millis(self.upsert_wait_ms),
            hold: Duration::from_millis(self.upsert_hold_ms),
        }
    }

    /// Delay between acquisition attempts.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

fn default_wait_ms() -> u64 {
    10_000
}

fn default_hold_ms() -> u64 {
    30_000
}

fn default_poll_ms() -> u64 {
    25
}
