//! Forcer tree: the ephemeral aggregation tree behind a barrier.
//!
//! The tree is rebuilt from the stored position rows on every evaluation
//! pass and dropped afterwards. Its shape is plan → stage → step group →
//! step, with the step-group level elided for positions that never pass
//! through a (non-rollback) step group.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::proctor::StatusProctor;
use super::types::{BarrierExecutionInstance, BarrierPosition, BarrierState};

/// Runtime id of the execution unit a forcer represents. May be empty while
/// the unit has not started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ForcerId(String);

impl ForcerId {
    /// Wraps a runtime id; `None` becomes the empty id.
    #[must_use]
    pub fn new(value: Option<&str>) -> Self {
        Self(value.unwrap_or_default().to_string())
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the unit has no runtime id yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ForcerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution level of a forcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForcerLevel {
    /// The whole plan execution.
    Plan,
    /// A stage.
    Stage,
    /// A step group.
    StepGroup,
    /// A step.
    Step,
}

impl ForcerLevel {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Stage => "stage",
            Self::StepGroup => "stepGroup",
            Self::Step => "step",
        }
    }
}

/// Context handed to the status proctor alongside a forcer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcerMetadata {
    /// Level of the forcer.
    pub level: ForcerLevel,
    /// Owning plan execution.
    pub plan_execution_id: String,
}

/// Readiness of one forcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForcerState {
    /// Not there yet.
    Approaching,
    /// Reached the rendezvous point.
    Arrived,
    /// Failed or aborted; will never arrive.
    Abandoned,
    /// Expired.
    TimedOut,
}

impl ForcerState {
    /// Barrier state a root outcome maps to.
    #[must_use]
    pub const fn barrier_state(self) -> BarrierState {
        match self {
            Self::Approaching => BarrierState::Standing,
            Self::Arrived => BarrierState::Down,
            Self::Abandoned => BarrierState::Endure,
            Self::TimedOut => BarrierState::TimedOut,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approaching => "APPROACHING",
            Self::Arrived => "ARRIVED",
            Self::Abandoned => "ABANDONED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

/// Folds child states into a composite state.
///
/// Abandoned dominates timed out, and arrival must be unanimous. An empty
/// set of children is approaching.
#[must_use]
pub fn aggregate<I>(states: I) -> ForcerState
where
    I: IntoIterator<Item = ForcerState>,
{
    let mut any = false;
    let mut timed_out = false;
    let mut all_arrived = true;
    for state in states {
        any = true;
        match state {
            ForcerState::Abandoned => return ForcerState::Abandoned,
            ForcerState::TimedOut => timed_out = true,
            ForcerState::Approaching => all_arrived = false,
            ForcerState::Arrived => {}
        }
    }
    if timed_out {
        ForcerState::TimedOut
    } else if any && all_arrived {
        ForcerState::Arrived
    } else {
        ForcerState::Approaching
    }
}

/// A node of the aggregation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forcer {
    /// Runtime id of the unit.
    pub id: ForcerId,
    /// Level and plan context.
    pub metadata: ForcerMetadata,
    /// Child units.
    pub children: Vec<Forcer>,
}

impl Forcer {
    fn leaf(id: Option<&str>, level: ForcerLevel, plan_execution_id: &str) -> Self {
        Self {
            id: ForcerId::new(id),
            metadata: ForcerMetadata {
                level,
                plan_execution_id: plan_execution_id.to_string(),
            },
            children: Vec::new(),
        }
    }

    fn with_child(mut self, child: Forcer) -> Self {
        self.children.push(child);
        self
    }

    /// Number of levels from this node down to its deepest leaf.
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Forcer::depth).max().unwrap_or(0)
    }

    /// Resolves the state of this subtree.
    ///
    /// A leaf is whatever the proctor reports. A composite whose own state is
    /// already terminal keeps it; otherwise it folds its children with
    /// [`aggregate`], stopping early on the first abandoned child.
    pub fn push_down<'a>(&'a self, proctor: &'a dyn StatusProctor) -> BoxFuture<'a, ForcerState> {
        async move {
            let own = if self.id.is_empty() {
                ForcerState::Approaching
            } else {
                proctor.resolve(&self.id, &self.metadata).await
            };

            if self.children.is_empty() || own != ForcerState::Approaching {
                return own;
            }

            let mut states = Vec::with_capacity(self.children.len());
            for child in &self.children {
                let state = child.push_down(proctor).await;
                if state == ForcerState::Abandoned {
                    return state;
                }
                states.push(state);
            }
            aggregate(states)
        }
        .boxed()
    }
}

/// Builds the forcer tree for one barrier instance.
///
/// Dummy positions stand in for strategy fan-out membership and contribute
/// no branch.
#[must_use]
pub fn build_forcer(instance: &BarrierExecutionInstance) -> Forcer {
    let plan_execution_id = instance.plan_execution_id.as_str();
    instance
        .positions()
        .iter()
        .filter(|position| !position.is_dummy_position)
        .fold(
            Forcer::leaf(Some(plan_execution_id), ForcerLevel::Plan, plan_execution_id),
            |root, position| root.with_child(stage_branch(position, plan_execution_id)),
        )
}

fn stage_branch(position: &BarrierPosition, plan_execution_id: &str) -> Forcer {
    let step = Forcer::leaf(
        position.step_runtime_id.as_deref(),
        ForcerLevel::Step,
        plan_execution_id,
    );
    let step_group_id = position
        .step_group_runtime_id
        .as_deref()
        .filter(|id| !id.is_empty());

    let stage = Forcer::leaf(
        position.stage_runtime_id.as_deref(),
        ForcerLevel::Stage,
        plan_execution_id,
    );
    match step_group_id {
        Some(id) if !position.step_group_rollback => stage.with_child(
            Forcer::leaf(Some(id), ForcerLevel::StepGroup, plan_execution_id).with_child(step),
        ),
        _ => stage.with_child(step),
    }
}
