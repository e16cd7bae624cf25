//! Barrier state machine.
//!
//! One evaluation builds the forcer tree from a snapshot, pushes live status
//! down through it and, on a terminal outcome, attempts the conditional
//! transition. Release notification follows only a transition this call
//! performed, so concurrent evaluators of the same barrier notify once.

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::forcer::{build_forcer, ForcerState};
use super::notifier::{ReleaseNotifier, ReleaseOutcome};
use super::proctor::StatusProctor;
use super::types::{BarrierExecutionInstance, BarrierId, BarrierState};
use crate::infrastructure::audit::{log_audit, AuditEvent};
use crate::store::{BarrierStore, RetryPolicy, StoreError};

/// Result of evaluating one barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Evaluated barrier.
    pub barrier_id: BarrierId,
    /// Root outcome of the forcer tree; `None` when the snapshot was
    /// already terminal and nothing was resolved.
    pub outcome: Option<ForcerState>,
    /// State the barrier is in after this evaluation, as far as it knows.
    pub state: BarrierState,
    /// This call performed the terminal transition.
    pub transitioned: bool,
}

/// Drives barriers from `Standing` to their terminal state.
#[derive(Clone)]
pub struct BarrierStateMachine {
    store: BarrierStore,
    proctor: Arc<dyn StatusProctor>,
    notifier: Arc<dyn ReleaseNotifier>,
    notify_retry: RetryPolicy,
}

impl BarrierStateMachine {
    /// Creates a state machine.
    #[must_use]
    pub fn new(
        store: BarrierStore,
        proctor: Arc<dyn StatusProctor>,
        notifier: Arc<dyn ReleaseNotifier>,
    ) -> Self {
        Self {
            store,
            proctor,
            notifier,
            notify_retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry budget for release notifications.
    #[must_use]
    pub fn with_notify_retry(mut self, notify_retry: RetryPolicy) -> Self {
        self.notify_retry = notify_retry;
        self
    }

    /// Instance store the machine writes through.
    #[must_use]
    pub fn store(&self) -> &BarrierStore {
        &self.store
    }

    /// Loads and evaluates barrier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id, or a store error
    /// from the load or the transition.
    pub async fn evaluate_id(&self, id: &BarrierId) -> Result<Evaluation, StoreError> {
        let instance = self.store.get(id).await?;
        self.evaluate(&instance).await
    }

    /// Evaluates one barrier snapshot.
    ///
    /// A failed notification is retried within the notify budget. If every
    /// attempt fails it is logged and counted but does not fail the
    /// evaluation: the state has already moved.
    ///
    /// # Errors
    ///
    /// Returns a store error if the conditional transition fails.
    #[instrument(
        skip_all,
        fields(barrier_id = %instance.id, identifier = %instance.identifier)
    )]
    pub async fn evaluate(
        &self,
        instance: &BarrierExecutionInstance,
    ) -> Result<Evaluation, StoreError> {
        if instance.barrier_state.is_terminal() {
            return Ok(Evaluation {
                barrier_id: instance.id.clone(),
                outcome: None,
                state: instance.barrier_state,
                transitioned: false,
            });
        }

        let forcer = build_forcer(instance);
        let outcome = forcer.push_down(self.proctor.as_ref()).await;
        let target = outcome.barrier_state();
        debug!(
            outcome = outcome.as_str(),
            members = forcer.children.len(),
            "Forcer tree resolved"
        );

        let Some(release) = ReleaseOutcome::for_state(target) else {
            return Ok(Evaluation {
                barrier_id: instance.id.clone(),
                outcome: Some(outcome),
                state: BarrierState::Standing,
                transitioned: false,
            });
        };

        let transitioned = self.store.update_state(&instance.id, target).await?;
        if transitioned {
            metrics::counter!("barrier_transitions_total", "state" => target.as_str()).increment(1);
            info!(state = %target, "Barrier resolved");
            log_audit(&AuditEvent::BarrierResolved {
                barrier_id: instance.id.to_string(),
                identifier: instance.identifier.clone(),
                plan_execution_id: instance.plan_execution_id.clone(),
                state: target.as_str().to_string(),
            });

            if let Err(e) = self.notify(&instance.id, release).await {
                metrics::counter!("barrier_release_notify_failures_total").increment(1);
                error!(error = %e, state = %target, "Release notification failed");
            }
        } else {
            debug!(state = %target, "Barrier resolved elsewhere");
        }

        Ok(Evaluation {
            barrier_id: instance.id.clone(),
            outcome: Some(outcome),
            state: target,
            transitioned,
        })
    }

    async fn notify(&self, id: &BarrierId, release: ReleaseOutcome) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.notifier.notify(id, release.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.notify_retry.max_attempts => {
                    let delay = self.notify_retry.backoff_after(attempt);
                    warn!(attempt, error = %e, "Release notification failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
