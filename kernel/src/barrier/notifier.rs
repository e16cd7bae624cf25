//! Release notification for resolved barriers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{BarrierId, BarrierState};

const RELEASE_CAPACITY: usize = 256;

/// Outcome delivered to everything waiting on a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// The barrier was not satisfied.
    pub failed: bool,
    /// Failure was caused by expiry.
    pub timed_out: bool,
    /// Human-readable reason for failures.
    pub message: Option<String>,
}

impl ReleaseOutcome {
    /// Every member arrived.
    #[must_use]
    pub const fn released() -> Self {
        Self {
            failed: false,
            timed_out: false,
            message: None,
        }
    }

    /// A member was abandoned.
    #[must_use]
    pub fn abandoned() -> Self {
        Self {
            failed: true,
            timed_out: false,
            message: Some("barrier abandoned".to_string()),
        }
    }

    /// A member expired.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            failed: true,
            timed_out: true,
            message: Some("barrier timed out".to_string()),
        }
    }

    /// Outcome for a terminal state; `None` while standing.
    #[must_use]
    pub fn for_state(state: BarrierState) -> Option<Self> {
        match state {
            BarrierState::Standing => None,
            BarrierState::Down => Some(Self::released()),
            BarrierState::Endure => Some(Self::abandoned()),
            BarrierState::TimedOut => Some(Self::timed_out()),
        }
    }
}

/// Wakes callers waiting on a barrier.
///
/// Delivery guarantees belong to the implementation; the state machine
/// calls it once per terminal transition and does not retry.
#[async_trait]
pub trait ReleaseNotifier: Send + Sync {
    /// Releases waiters of `barrier_id` with `outcome`.
    async fn notify(&self, barrier_id: &BarrierId, outcome: ReleaseOutcome) -> anyhow::Result<()>;
}

/// A release as seen by in-process subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRelease {
    /// Released barrier.
    pub barrier_id: BarrierId,
    /// Outcome.
    pub outcome: ReleaseOutcome,
}

/// In-process notifier fanning releases out over a broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<BarrierRelease>,
    delivered: Arc<AtomicUsize>,
}

impl BroadcastNotifier {
    /// Creates a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(RELEASE_CAPACITY);
        Self {
            sender,
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribes to future releases.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BarrierRelease> {
        self.sender.subscribe()
    }

    /// Number of releases sent so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseNotifier for BroadcastNotifier {
    async fn notify(&self, barrier_id: &BarrierId, outcome: ReleaseOutcome) -> anyhow::Result<()> {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let release = BarrierRelease {
            barrier_id: barrier_id.clone(),
            outcome,
        };
        if let Ok(receiver_count) = self.sender.send(release) {
            debug!(barrier_id = %barrier_id, receiver_count, "Release broadcast");
        } else {
            warn!(barrier_id = %barrier_id, "Release broadcast with no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_per_state() {
        assert_eq!(ReleaseOutcome::for_state(BarrierState::Standing), None);
        assert_eq!(
            ReleaseOutcome::for_state(BarrierState::Down),
            Some(ReleaseOutcome::released())
        );
        let endure = ReleaseOutcome::for_state(BarrierState::Endure).unwrap();
        assert!(endure.failed && !endure.timed_out);
        let expired = ReleaseOutcome::for_state(BarrierState::TimedOut).unwrap();
        assert!(expired.failed && expired.timed_out);
        assert_eq!(expired.message.as_deref(), Some("barrier timed out"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();
        let id = BarrierId::from("b-1");

        notifier.notify(&id, ReleaseOutcome::abandoned()).await.unwrap();

        let release = rx.recv().await.unwrap();
        assert_eq!(release.barrier_id, id);
        assert!(release.outcome.failed);
        assert_eq!(notifier.delivered(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_succeeds() {
        let notifier = BroadcastNotifier::new();
        notifier
            .notify(&BarrierId::from("b-1"), ReleaseOutcome::released())
            .await
            .unwrap();
        assert_eq!(notifier.delivered(), 1);
    }
}
