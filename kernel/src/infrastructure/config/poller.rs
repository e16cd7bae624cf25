//! Poller configuration for the barrier kernel.

use serde::Deserialize;
use std::time::Duration;

use crate::poller::PollerConfig;

/// Background poller settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PollerSettings {
    /// Run the poller in this process (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between passes (default: 60)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Barriers claimed per batch (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Barriers evaluated concurrently (default: 8)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Worker name in logs; a random one is generated when unset.
    pub worker_id: Option<String>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            worker_id: None,
        }
    }
}

impl PollerSettings {
    /// Poller configuration. The claim lease equals the interval.
    #[must_use]
    pub fn to_config(&self) -> PollerConfig {
        let interval = Duration::from_secs(self.interval_secs.max(1));
        PollerConfig {
            interval,
            batch_size: self.batch_size.max(1),
            concurrency: self.concurrency.max(1),
            lease: interval,
            worker_id: self
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("poller-{}", uuid::Uuid::new_v4())),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    100
}

fn default_concurrency() -> usize {
    8
}
