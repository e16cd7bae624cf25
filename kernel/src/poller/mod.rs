//! Background barrier poller.
//!
//! Each pass claims due `Standing` barriers in batches and feeds them through
//! the state machine. Claims push the instance's next iteration forward by
//! the lease, so several pollers sharing a database take disjoint batches.

use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::barrier::machine::BarrierStateMachine;
use crate::barrier::types::BarrierId;
use crate::store::StoreError;

/// Configuration for the poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between passes.
    pub interval: Duration,
    /// Barriers claimed per batch.
    pub batch_size: u32,
    /// Barriers evaluated concurrently.
    pub concurrency: usize,
    /// How long a claimed barrier stays invisible to other pollers.
    pub lease: Duration,
    /// Name of this worker in logs.
    pub worker_id: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            concurrency: 8,
            lease: Duration::from_secs(60),
            worker_id: "barrier-poller".to_string(),
        }
    }
}

/// Counts of one batch or pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Barriers claimed.
    pub claimed: usize,
    /// Barriers evaluated without error.
    pub evaluated: usize,
    /// Barriers this poller moved to a terminal state.
    pub resolved: usize,
    /// Barriers whose evaluation failed.
    pub failed: usize,
}

impl PollSummary {
    fn absorb(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.evaluated += other.evaluated;
        self.resolved += other.resolved;
        self.failed += other.failed;
    }
}

/// Recurring scan over standing barriers.
pub struct BarrierPoller {
    machine: BarrierStateMachine,
    config: PollerConfig,
}

impl BarrierPoller {
    /// Creates a poller. Batch size and concurrency are raised to at
    /// least one.
    #[must_use]
    pub fn new(machine: BarrierStateMachine, mut config: PollerConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        config.concurrency = config.concurrency.max(1);
        Self { machine, config }
    }

    /// Runs passes until `shutdown` resolves.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            worker_id = %self.config.worker_id,
            interval_ms = self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "barrier poller started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(worker_id = %self.config.worker_id, "barrier poller shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.poll_until_drained().await {
                        metrics::counter!("barrier_poller_errors_total").increment(1);
                        error!(error = %e, "barrier poller pass failed");
                    }
                }
            }
        }
    }

    /// Claims and evaluates batches until a batch comes back short.
    ///
    /// # Errors
    ///
    /// Returns an error if a claim fails. Failed evaluations are counted,
    /// not returned.
    pub async fn poll_until_drained(&self) -> Result<PollSummary, StoreError> {
        let started = Instant::now();
        let mut total = PollSummary::default();
        loop {
            let batch = self.poll_once().await?;
            total.absorb(batch);
            if batch.claimed < self.config.batch_size as usize {
                break;
            }
            debug!(claimed = batch.claimed, "batch filled, continuing");
        }

        metrics::histogram!("barrier_poller_pass_seconds").record(started.elapsed().as_secs_f64());
        if total.claimed > 0 {
            info!(
                worker_id = %self.config.worker_id,
                claimed = total.claimed,
                resolved = total.resolved,
                failed = total.failed,
                "barrier poller pass finished"
            );
        }
        Ok(total)
    }

    /// Claims one batch and evaluates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim fails.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn poll_once(&self) -> Result<PollSummary, StoreError> {
        let ids = self
            .machine
            .store()
            .claim_standing(self.config.batch_size, self.config.lease)
            .await?;
        metrics::counter!("barrier_poller_claimed_total").increment(ids.len() as u64);

        let mut summary = PollSummary {
            claimed: ids.len(),
            ..PollSummary::default()
        };
        let outcomes: Vec<(BarrierId, Result<bool, StoreError>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.machine.evaluate_id(&id).await.map(|e| e.transitioned);
                (id, result)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(transitioned) => {
                    summary.evaluated += 1;
                    if transitioned {
                        summary.resolved += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    metrics::counter!("barrier_poller_failures_total").increment(1);
                    warn!(barrier_id = %id, error = %e, "barrier evaluation failed");
                }
            }
        }
        Ok(summary)
    }
}
