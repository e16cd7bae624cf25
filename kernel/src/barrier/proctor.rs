//! Status proctor: maps live execution status onto forcer readiness.
//!
//! The execution-status store is external. This module defines the query
//! contract it must satisfy ([`ExecutionStatusSource`]) and the mapping from
//! its raw statuses to [`ForcerState`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::forcer::{ForcerId, ForcerLevel, ForcerMetadata, ForcerState};

/// Resolves the readiness of one forcer.
///
/// Implementations must never fail: anything unknown, missing or
/// unreadable resolves to [`ForcerState::Approaching`].
#[async_trait]
pub trait StatusProctor: Send + Sync {
    /// Readiness of the unit `id` at `metadata.level`.
    async fn resolve(&self, id: &ForcerId, metadata: &ForcerMetadata) -> ForcerState;
}

/// Raw status of a plan or node execution, as the execution layer records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ExecutionStatus {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    TimedWaiting,
    InterventionWaiting,
    ApprovalWaiting,
    ResourceWaiting,
    Paused,
    Discontinuing,
    Succeeded,
    IgnoreFailed,
    Skipped,
    Suspended,
    Failed,
    Errored,
    Aborted,
    ApprovalRejected,
    Expired,
}

impl ExecutionStatus {
    /// Statuses that count as successful completion.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::IgnoreFailed | Self::Skipped | Self::Suspended
        )
    }

    /// Terminal statuses that are not successful.
    #[must_use]
    pub const fn is_broken(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Errored | Self::Aborted | Self::ApprovalRejected | Self::Expired
        )
    }

    /// Readiness of a unit at `level` in this status.
    ///
    /// A step parked on an asynchronous callback has already done its
    /// synchronisation-relevant work and counts as arrived.
    #[must_use]
    pub const fn forcer_state(self, level: ForcerLevel) -> ForcerState {
        if self.is_positive() {
            ForcerState::Arrived
        } else if matches!(self, Self::Expired) {
            ForcerState::TimedOut
        } else if self.is_broken() {
            ForcerState::Abandoned
        } else if matches!(level, ForcerLevel::Step) && matches!(self, Self::AsyncWaiting) {
            ForcerState::Arrived
        } else {
            ForcerState::Approaching
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
    }
}

/// Query contract of the external execution-status store.
///
/// `Ok(None)` means the execution is unknown.
#[async_trait]
pub trait ExecutionStatusSource: Send + Sync {
    /// Status of a whole plan execution.
    async fn plan_status(&self, plan_execution_id: &str) -> anyhow::Result<Option<ExecutionStatus>>;
    /// Status of one node execution.
    async fn node_status(&self, node_execution_id: &str) -> anyhow::Result<Option<ExecutionStatus>>;
}

/// [`StatusProctor`] backed by an [`ExecutionStatusSource`].
#[derive(Clone)]
pub struct ExecutionStatusProctor {
    source: Arc<dyn ExecutionStatusSource>,
}

impl ExecutionStatusProctor {
    /// Wraps a status source.
    #[must_use]
    pub fn new(source: Arc<dyn ExecutionStatusSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl StatusProctor for ExecutionStatusProctor {
    async fn resolve(&self, id: &ForcerId, metadata: &ForcerMetadata) -> ForcerState {
        let lookup = match metadata.level {
            ForcerLevel::Plan => self.source.plan_status(id.as_str()).await,
            _ => self.source.node_status(id.as_str()).await,
        };

        match lookup {
            Ok(Some(status)) => status.forcer_state(metadata.level),
            Ok(None) => {
                debug!(
                    forcer_id = %id,
                    level = metadata.level.as_str(),
                    "Execution not found, treating as approaching"
                );
                ForcerState::Approaching
            }
            Err(e) => {
                warn!(
                    forcer_id = %id,
                    level = metadata.level.as_str(),
                    plan_execution_id = %metadata.plan_execution_id,
                    error = %e,
                    "Status lookup failed, treating as approaching"
                );
                ForcerState::Approaching
            }
        }
    }
}
