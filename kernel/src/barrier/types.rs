//! Barrier domain types.
//!
//! A [`BarrierExecutionInstance`] is the persisted unit of coordination: one
//! named barrier inside one running plan execution, together with the
//! structural positions that must all arrive before it goes down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::error::BarrierError;

/// Barrier instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarrierId(String);

impl BarrierId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BarrierId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BarrierId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a barrier instance.
///
/// `Standing` is the only non-terminal state. Every instance leaves it at
/// most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    /// Open and waiting for its members.
    #[default]
    Standing,
    /// Every member arrived.
    Down,
    /// A member was abandoned; the barrier can never be satisfied.
    Endure,
    /// A member expired.
    TimedOut,
}

impl BarrierState {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standing => "STANDING",
            Self::Down => "DOWN",
            Self::Endure => "ENDURE",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Returns `true` for every state except `Standing`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Standing)
    }
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarrierState {
    type Err = BarrierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STANDING" => Ok(Self::Standing),
            "DOWN" => Ok(Self::Down),
            "ENDURE" => Ok(Self::Endure),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(BarrierError::UnknownState(other.to_string())),
        }
    }
}

/// Structural level a position update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionType {
    /// A stage node.
    Stage,
    /// A step-group node.
    StepGroup,
    /// A step node.
    Step,
}

impl PositionType {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "STAGE",
            Self::StepGroup => "STEP_GROUP",
            Self::Step => "STEP",
        }
    }

    /// Column holding this level's definition-time id.
    #[must_use]
    pub const fn setup_column(self) -> &'static str {
        match self {
            Self::Stage => "stage_setup_id",
            Self::StepGroup => "step_group_setup_id",
            Self::Step => "step_setup_id",
        }
    }

    /// Column holding this level's runtime id.
    #[must_use]
    pub const fn runtime_column(self) -> &'static str {
        match self {
            Self::Stage => "stage_runtime_id",
            Self::StepGroup => "step_group_runtime_id",
            Self::Step => "step_runtime_id",
        }
    }

    /// The definition-time id this level reads from a position.
    #[must_use]
    pub fn setup_id(self, position: &BarrierPosition) -> Option<&str> {
        match self {
            Self::Stage => Some(position.stage_setup_id.as_str()),
            Self::StepGroup => position.step_group_setup_id.as_deref(),
            Self::Step => Some(position.step_setup_id.as_str()),
        }
    }

    /// The runtime id this level reads from a position.
    #[must_use]
    pub fn runtime_id(self, position: &BarrierPosition) -> Option<&str> {
        match self {
            Self::Stage => position.stage_runtime_id.as_deref(),
            Self::StepGroup => position.step_group_runtime_id.as_deref(),
            Self::Step => position.step_runtime_id.as_deref(),
        }
    }
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionType {
    type Err = BarrierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STAGE" => Ok(Self::Stage),
            "STEP_GROUP" => Ok(Self::StepGroup),
            "STEP" => Ok(Self::Step),
            other => Err(BarrierError::UnknownPositionType(other.to_string())),
        }
    }
}

/// A stage that contains at least one member of a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageDetail {
    /// Stage identifier from the definition.
    pub identifier: String,
    /// Display name, when known.
    pub name: Option<String>,
}

impl StageDetail {
    /// Stage detail carrying only an identifier.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
        }
    }
}

/// Structural metadata of a barrier. Grows by set union only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BarrierSetupInfo {
    /// Barrier display name.
    pub name: String,
    /// Barrier identifier.
    pub identifier: String,
    /// Stages containing members.
    pub stages: BTreeSet<StageDetail>,
    /// Every strategy node enclosing a member.
    pub strategy_setup_ids: BTreeSet<String>,
}

/// One required rendezvous point of a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BarrierPosition {
    /// Definition-time id of the enclosing stage.
    pub stage_setup_id: String,
    /// Definition-time id of the enclosing step group.
    pub step_group_setup_id: Option<String>,
    /// Definition-time id of the barrier step.
    pub step_setup_id: String,
    /// Nearest enclosing strategy node.
    pub strategy_setup_id: Option<String>,
    /// Every enclosing strategy node, outermost first.
    pub all_strategy_setup_ids: Vec<String>,
    /// Runtime id of the stage, once started.
    pub stage_runtime_id: Option<String>,
    /// Runtime id of the step group, once started.
    pub step_group_runtime_id: Option<String>,
    /// Runtime id of the step, once started.
    pub step_runtime_id: Option<String>,
    /// The step group is a rollback path.
    pub step_group_rollback: bool,
    /// Placeholder for membership under a strategy fan-out.
    pub is_dummy_position: bool,
    /// Kind of the nearest strategy node, if any.
    pub strategy_node_type: Option<PositionType>,
}

impl BarrierPosition {
    /// Position for a barrier step at `stage_setup_id` / `step_setup_id`.
    #[must_use]
    pub fn new(stage_setup_id: impl Into<String>, step_setup_id: impl Into<String>) -> Self {
        Self {
            stage_setup_id: stage_setup_id.into(),
            step_setup_id: step_setup_id.into(),
            ..Self::default()
        }
    }

    /// Sets the enclosing step group.
    #[must_use]
    pub fn in_step_group(mut self, step_group_setup_id: impl Into<String>) -> Self {
        self.step_group_setup_id = Some(step_group_setup_id.into());
        self
    }

    /// Sets all three runtime ids at once.
    #[must_use]
    pub fn with_runtime_ids(
        mut self,
        stage: Option<&str>,
        step_group: Option<&str>,
        step: Option<&str>,
    ) -> Self {
        self.stage_runtime_id = stage.map(str::to_string);
        self.step_group_runtime_id = step_group.map(str::to_string);
        self.step_runtime_id = step.map(str::to_string);
        self
    }

    /// Whether `other` names the same member as `self`.
    ///
    /// Structural ids and flags must be equal. Runtime ids must not
    /// conflict: an id missing on either side matches anything. Rows are
    /// distinct replicas under a strategy fan-out only when both hold a
    /// runtime id and the ids differ.
    #[must_use]
    pub fn is_same_member(&self, other: &Self) -> bool {
        fn compatible(a: Option<&String>, b: Option<&String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.stage_setup_id == other.stage_setup_id
            && self.step_group_setup_id == other.step_group_setup_id
            && self.step_setup_id == other.step_setup_id
            && self.strategy_setup_id == other.strategy_setup_id
            && self.step_group_rollback == other.step_group_rollback
            && self.is_dummy_position == other.is_dummy_position
            && self.strategy_node_type == other.strategy_node_type
            && compatible(self.stage_runtime_id.as_ref(), other.stage_runtime_id.as_ref())
            && compatible(
                self.step_group_runtime_id.as_ref(),
                other.step_group_runtime_id.as_ref(),
            )
            && compatible(self.step_runtime_id.as_ref(), other.step_runtime_id.as_ref())
    }

    /// Whether every runtime id set on `other` is already set on `self`.
    #[must_use]
    pub fn covers_runtime_ids(&self, other: &Self) -> bool {
        (other.stage_runtime_id.is_none() || self.stage_runtime_id.is_some())
            && (other.step_group_runtime_id.is_none() || self.step_group_runtime_id.is_some())
            && (other.step_runtime_id.is_none() || self.step_runtime_id.is_some())
    }

    /// Copies runtime ids from `other` into fields that are still empty.
    /// Returns whether any field changed.
    pub fn fill_runtime_ids(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (field, incoming) in [
            (&mut self.stage_runtime_id, &other.stage_runtime_id),
            (&mut self.step_group_runtime_id, &other.step_group_runtime_id),
            (&mut self.step_runtime_id, &other.step_runtime_id),
        ] {
            if field.is_none() && incoming.is_some() {
                field.clone_from(incoming);
                changed = true;
            }
        }
        changed
    }
}

/// Positions of one barrier inside one plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BarrierPositionInfo {
    /// Owning plan execution.
    pub plan_execution_id: String,
    /// Required members.
    pub positions: Vec<BarrierPosition>,
}

/// Persisted barrier instance.
///
/// In-memory copies are read-only snapshots; every mutation goes through
/// [`crate::store::BarrierStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierExecutionInstance {
    /// Instance identity.
    pub id: BarrierId,
    /// Barrier display name.
    pub name: String,
    /// Barrier identifier, unique within a definition.
    pub identifier: String,
    /// Owning plan execution.
    pub plan_execution_id: String,
    /// Current lifecycle state.
    pub barrier_state: BarrierState,
    /// Structural metadata.
    pub setup_info: BarrierSetupInfo,
    /// Required members.
    pub position_info: BarrierPositionInfo,
    /// Concurrency width per strategy node.
    pub strategy_concurrency: BTreeMap<String, u32>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl BarrierExecutionInstance {
    /// New `Standing` instance for `identifier` inside `plan_execution_id`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        identifier: impl Into<String>,
        plan_execution_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let identifier = identifier.into();
        let plan_execution_id = plan_execution_id.into();
        let now = Utc::now();
        Self {
            id: BarrierId::generate(),
            setup_info: BarrierSetupInfo {
                name: name.clone(),
                identifier: identifier.clone(),
                ..BarrierSetupInfo::default()
            },
            position_info: BarrierPositionInfo {
                plan_execution_id: plan_execution_id.clone(),
                positions: Vec::new(),
            },
            name,
            identifier,
            plan_execution_id,
            barrier_state: BarrierState::Standing,
            strategy_concurrency: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds a stage to the setup info.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDetail) -> Self {
        self.setup_info.stages.insert(stage);
        self
    }

    /// Adds a position.
    #[must_use]
    pub fn with_position(mut self, position: BarrierPosition) -> Self {
        self.position_info.positions.push(position);
        self
    }

    /// Adds strategy setup ids to the setup info.
    #[must_use]
    pub fn with_strategy_setup_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.setup_info
            .strategy_setup_ids
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Current positions.
    #[must_use]
    pub fn positions(&self) -> &[BarrierPosition] {
        &self.position_info.positions
    }
}

/// A runtime id became known for a structural element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    /// Owning plan execution.
    pub plan_execution_id: String,
    /// Level of the element.
    pub position_type: PositionType,
    /// Definition-time id of the element.
    pub position_setup_id: String,
    /// Runtime id of the element.
    pub position_execution_id: String,
    /// Runtime id of the enclosing stage, when known.
    pub stage_execution_id: Option<String>,
    /// Runtime id of the enclosing step group, when known.
    pub step_group_execution_id: Option<String>,
}

impl PositionUpdate {
    /// Update without parent runtime ids.
    #[must_use]
    pub fn new(
        plan_execution_id: impl Into<String>,
        position_type: PositionType,
        position_setup_id: impl Into<String>,
        position_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            position_type,
            position_setup_id: position_setup_id.into(),
            position_execution_id: position_execution_id.into(),
            stage_execution_id: None,
            step_group_execution_id: None,
        }
    }

    /// Narrows the match to rows under this stage execution.
    #[must_use]
    pub fn under_stage(mut self, stage_execution_id: impl Into<String>) -> Self {
        self.stage_execution_id = Some(stage_execution_id.into());
        self
    }

    /// Narrows the match to rows under this step-group execution.
    #[must_use]
    pub fn under_step_group(mut self, step_group_execution_id: impl Into<String>) -> Self {
        self.step_group_execution_id = Some(step_group_execution_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_state_round_trips_through_storage_form() {
        for state in [
            BarrierState::Standing,
            BarrierState::Down,
            BarrierState::Endure,
            BarrierState::TimedOut,
        ] {
            assert_eq!(state.as_str().parse::<BarrierState>().unwrap(), state);
        }
        assert!(!BarrierState::Standing.is_terminal());
        assert!(BarrierState::Endure.is_terminal());
    }

    #[test]
    fn test_unknown_position_type_is_rejected() {
        let err = "PIPELINE".parse::<PositionType>().unwrap_err();
        assert!(matches!(err, BarrierError::UnknownPositionType(t) if t == "PIPELINE"));
    }

    #[test]
    fn test_same_member_ignores_missing_runtime_ids() {
        let stored = BarrierPosition::new("stage", "step").with_runtime_ids(
            Some("stage-exec"),
            None,
            Some("step-exec"),
        );
        let registration = BarrierPosition::new("stage", "step");
        assert!(stored.is_same_member(&registration));
    }

    #[test]
    fn test_same_member_distinguishes_replicas() {
        let replica_a = BarrierPosition::new("stage", "step").with_runtime_ids(Some("a"), None, None);
        let replica_b = BarrierPosition::new("stage", "step").with_runtime_ids(Some("b"), None, None);
        assert!(!replica_a.is_same_member(&replica_b));
    }

    #[test]
    fn test_same_member_accepts_ids_missing_on_stored_side() {
        let stored = BarrierPosition::new("stage", "step");
        let registration = BarrierPosition::new("stage", "step").with_runtime_ids(
            Some("stage-exec"),
            None,
            Some("step-exec"),
        );
        assert!(stored.is_same_member(&registration));
        assert!(!stored.covers_runtime_ids(&registration));
        assert!(registration.covers_runtime_ids(&stored));
    }

    #[test]
    fn test_fill_runtime_ids_is_write_once() {
        let mut stored = BarrierPosition::new("stage", "step").with_runtime_ids(
            Some("stage-exec"),
            None,
            None,
        );
        let incoming = BarrierPosition::new("stage", "step").with_runtime_ids(
            Some("other-stage"),
            Some("group-exec"),
            Some("step-exec"),
        );

        assert!(stored.fill_runtime_ids(&incoming));
        assert_eq!(stored.stage_runtime_id.as_deref(), Some("stage-exec"));
        assert_eq!(stored.step_group_runtime_id.as_deref(), Some("group-exec"));
        assert_eq!(stored.step_runtime_id.as_deref(), Some("step-exec"));
        assert!(!stored.fill_runtime_ids(&incoming));
    }

    #[test]
    fn test_same_member_requires_equal_flags() {
        let plain = BarrierPosition::new("stage", "step");
        let mut rollback = plain.clone();
        rollback.step_group_rollback = true;
        assert!(!plain.is_same_member(&rollback));
    }
}
