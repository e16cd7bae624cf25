//! Position registry: which structural positions belong to which barrier.
//!
//! A workflow definition is walked once. Every barrier step found becomes a
//! [`BarrierPosition`] of the barrier it references, identified by the
//! definition-time ids of its stage, step group and step.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::error::BarrierError;
use super::types::{
    BarrierExecutionInstance, BarrierPosition, BarrierSetupInfo, PositionType, StageDetail,
};

/// Step type of a barrier step.
pub const BARRIER_STEP_TYPE: &str = "Barrier";

/// A typed workflow definition, as handed over by the definition parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDefinition {
    /// Plan-wide flow control.
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Top-level stages in order.
    #[serde(default)]
    pub stages: Vec<StageElement>,
}

/// Flow-control section of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControl {
    /// Declared barriers.
    #[serde(default)]
    pub barriers: Vec<BarrierDeclaration>,
}

/// A barrier declared in flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierDeclaration {
    /// Barrier identifier.
    pub identifier: String,
    /// Display name.
    pub name: String,
}

/// Entry of a stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageElement {
    /// A single stage.
    Stage(StageNode),
    /// Stages running side by side.
    Parallel(Vec<StageElement>),
}

/// A stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageNode {
    /// Definition-time id.
    pub uuid: String,
    /// Stage identifier.
    pub identifier: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Looping strategy wrapping the stage.
    #[serde(default)]
    pub strategy: Option<StrategyNode>,
    /// Execution steps.
    #[serde(default)]
    pub steps: Vec<StepElement>,
    /// Steps run on rollback.
    #[serde(default)]
    pub rollback_steps: Vec<StepElement>,
}

/// A looping strategy (matrix, repeat, parallelism).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyNode {
    /// Definition-time id.
    pub uuid: String,
}

/// Entry of a step list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepElement {
    /// A single step.
    Step(StepNode),
    /// A group of steps.
    StepGroup(StepGroupNode),
    /// Steps running side by side.
    Parallel(Vec<StepElement>),
}

/// A step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNode {
    /// Definition-time id.
    pub uuid: String,
    /// Step identifier.
    pub identifier: String,
    /// Step type; barrier steps use [`BARRIER_STEP_TYPE`].
    #[serde(rename = "type")]
    pub step_type: String,
    /// Referenced barrier, for barrier steps.
    #[serde(default)]
    pub barrier_ref: Option<String>,
}

/// A step group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepGroupNode {
    /// Definition-time id.
    pub uuid: String,
    /// Step group identifier.
    pub identifier: String,
    /// Looping strategy wrapping the group.
    #[serde(default)]
    pub strategy: Option<StrategyNode>,
    /// Member steps.
    #[serde(default)]
    pub steps: Vec<StepElement>,
}

/// Barriers of one definition with their members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierLayout {
    /// Setup info per barrier identifier.
    pub setup_info: BTreeMap<String, BarrierSetupInfo>,
    /// Positions per barrier identifier, in definition order.
    pub positions: BTreeMap<String, Vec<BarrierPosition>>,
}

impl BarrierLayout {
    /// One `Standing` instance per barrier for a new plan execution.
    #[must_use]
    pub fn instances(&self, plan_execution_id: &str) -> Vec<BarrierExecutionInstance> {
        self.setup_info
            .values()
            .map(|setup| {
                let mut instance = BarrierExecutionInstance::new(
                    setup.name.clone(),
                    setup.identifier.clone(),
                    plan_execution_id,
                );
                instance.setup_info = setup.clone();
                instance.position_info.positions = self
                    .positions
                    .get(&setup.identifier)
                    .cloned()
                    .unwrap_or_default();
                instance
            })
            .collect()
    }
}

/// Anything that can describe the barriers of a workflow.
pub trait WorkflowDefinitionSource: Send + Sync {
    /// Walks the definition.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidDefinition`] for structural errors.
    fn barrier_layout(&self) -> Result<BarrierLayout, BarrierError>;

    /// Positions per barrier identifier.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidDefinition`] for structural errors.
    fn extract_barrier_positions(
        &self,
    ) -> Result<BTreeMap<String, Vec<BarrierPosition>>, BarrierError> {
        Ok(self.barrier_layout()?.positions)
    }

    /// Setup info of every declared barrier.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidDefinition`] for structural errors.
    fn extract_barrier_setup_info(&self) -> Result<Vec<BarrierSetupInfo>, BarrierError> {
        Ok(self.barrier_layout()?.setup_info.into_values().collect())
    }
}

impl WorkflowDefinitionSource for PlanDefinition {
    fn barrier_layout(&self) -> Result<BarrierLayout, BarrierError> {
        PositionRegistry::extract(self)
    }
}

#[derive(Clone)]
struct Strategy<'a> {
    id: &'a str,
    node_type: PositionType,
}

#[derive(Clone, Default)]
struct Scope<'a> {
    stage: Option<&'a StageNode>,
    step_group: Option<&'a str>,
    rollback: bool,
    strategies: Vec<Strategy<'a>>,
}

/// Walks a [`PlanDefinition`] into a [`BarrierLayout`].
pub struct PositionRegistry;

impl PositionRegistry {
    /// Extracts the barriers of `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidDefinition`] when a barrier is declared
    /// twice or with an empty identifier, or a barrier step has no reference
    /// or references an undeclared barrier.
    pub fn extract(definition: &PlanDefinition) -> Result<BarrierLayout, BarrierError> {
        let mut layout = BarrierLayout::default();
        for declaration in &definition.flow_control.barriers {
            if declaration.identifier.is_empty() {
                return Err(BarrierError::InvalidDefinition(
                    "barrier declared with an empty identifier".to_string(),
                ));
            }
            if layout.setup_info.contains_key(&declaration.identifier) {
                return Err(BarrierError::InvalidDefinition(format!(
                    "barrier {} declared more than once",
                    declaration.identifier
                )));
            }
            layout.setup_info.insert(
                declaration.identifier.clone(),
                BarrierSetupInfo {
                    name: declaration.name.clone(),
                    identifier: declaration.identifier.clone(),
                    stages: BTreeSet::new(),
                    strategy_setup_ids: BTreeSet::new(),
                },
            );
            layout
                .positions
                .insert(declaration.identifier.clone(), Vec::new());
        }

        for element in &definition.stages {
            walk_stage_element(element, &Scope::default(), &mut layout)?;
        }

        debug!(
            barriers = layout.setup_info.len(),
            positions = layout.positions.values().map(Vec::len).sum::<usize>(),
            "Barrier positions extracted"
        );
        Ok(layout)
    }
}

fn walk_stage_element<'a>(
    element: &'a StageElement,
    scope: &Scope<'a>,
    layout: &mut BarrierLayout,
) -> Result<(), BarrierError> {
    match element {
        StageElement::Parallel(elements) => {
            for element in elements {
                walk_stage_element(element, scope, layout)?;
            }
        }
        StageElement::Stage(stage) => {
            if stage.uuid.is_empty() {
                return Err(BarrierError::InvalidDefinition(format!(
                    "stage {} has an empty uuid",
                    stage.identifier
                )));
            }
            let mut inner = scope.clone();
            inner.stage = Some(stage);
            if let Some(strategy) = &stage.strategy {
                inner.strategies.push(Strategy {
                    id: &strategy.uuid,
                    node_type: PositionType::Stage,
                });
            }
            for step in &stage.steps {
                walk_step_element(step, &inner, layout)?;
            }
            inner.rollback = true;
            for step in &stage.rollback_steps {
                walk_step_element(step, &inner, layout)?;
            }
        }
    }
    Ok(())
}

fn walk_step_element<'a>(
    element: &'a StepElement,
    scope: &Scope<'a>,
    layout: &mut BarrierLayout,
) -> Result<(), BarrierError> {
    match element {
        StepElement::Parallel(elements) => {
            for element in elements {
                walk_step_element(element, scope, layout)?;
            }
        }
        StepElement::StepGroup(group) => {
            let mut inner = scope.clone();
            inner.step_group = Some(&group.uuid);
            if let Some(strategy) = &group.strategy {
                inner.strategies.push(Strategy {
                    id: &strategy.uuid,
                    node_type: PositionType::StepGroup,
                });
            }
            for step in &group.steps {
                walk_step_element(step, &inner, layout)?;
            }
        }
        StepElement::Step(step) if step.step_type == BARRIER_STEP_TYPE => {
            record_barrier_step(step, scope, layout)?;
        }
        StepElement::Step(_) => {}
    }
    Ok(())
}

fn record_barrier_step(
    step: &StepNode,
    scope: &Scope<'_>,
    layout: &mut BarrierLayout,
) -> Result<(), BarrierError> {
    let barrier = step
        .barrier_ref
        .as_deref()
        .filter(|reference| !reference.is_empty())
        .ok_or_else(|| {
            BarrierError::InvalidDefinition(format!(
                "barrier step {} has no barrier reference",
                step.identifier
            ))
        })?;
    let Some(stage) = scope.stage else {
        return Err(BarrierError::InvalidDefinition(format!(
            "barrier step {} is outside a stage",
            step.identifier
        )));
    };
    let setup = layout.setup_info.get_mut(barrier).ok_or_else(|| {
        BarrierError::InvalidDefinition(format!(
            "barrier step {} references undeclared barrier {barrier}",
            step.identifier
        ))
    })?;

    setup.stages.insert(StageDetail {
        identifier: stage.identifier.clone(),
        name: stage.name.clone(),
    });
    setup
        .strategy_setup_ids
        .extend(scope.strategies.iter().map(|s| s.id.to_string()));

    let nearest = scope.strategies.last();
    let position = BarrierPosition {
        stage_setup_id: stage.uuid.clone(),
        step_group_setup_id: scope.step_group.map(str::to_string),
        step_setup_id: step.uuid.clone(),
        strategy_setup_id: nearest.map(|s| s.id.to_string()),
        all_strategy_setup_ids: scope.strategies.iter().map(|s| s.id.to_string()).collect(),
        step_group_rollback: scope.rollback && scope.step_group.is_some(),
        is_dummy_position: nearest.is_some(),
        strategy_node_type: nearest.map(|s| s.node_type),
        ..BarrierPosition::default()
    };
    layout
        .positions
        .entry(barrier.to_string())
        .or_default()
        .push(position);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn barrier_step(uuid: &str, barrier: &str) -> serde_json::Value {
        json!({ "step": { "uuid": uuid, "identifier": uuid, "type": "Barrier", "barrierRef": barrier } })
    }

    fn plan(stages: serde_json::Value) -> PlanDefinition {
        serde_json::from_value(json!({
            "flowControl": { "barriers": [
                { "identifier": "sync", "name": "Sync" },
                { "identifier": "unused", "name": "Unused" }
            ] },
            "stages": stages
        }))
        .unwrap()
    }

    #[test]
    fn test_positions_per_barrier_step() {
        let definition = plan(json!([
            { "parallel": [
                { "stage": { "uuid": "s1", "identifier": "build", "name": "Build", "steps": [
                    { "step": { "uuid": "x", "identifier": "compile", "type": "Run" } },
                    barrier_step("b1", "sync")
                ] } },
                { "stage": { "uuid": "s2", "identifier": "test", "steps": [
                    { "stepGroup": { "uuid": "g1", "identifier": "group", "steps": [
                        barrier_step("b2", "sync")
                    ] } }
                ] } }
            ] }
        ]));

        let layout = definition.barrier_layout().unwrap();
        let positions = &layout.positions["sync"];

        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0], BarrierPosition::new("s1", "b1"));
        assert_eq!(positions[1], BarrierPosition::new("s2", "b2").in_step_group("g1"));
        assert!(layout.positions["unused"].is_empty());

        let setup = &layout.setup_info["sync"];
        assert_eq!(setup.stages.len(), 2);
        assert!(setup.stages.contains(&StageDetail {
            identifier: "build".into(),
            name: Some("Build".into())
        }));
    }

    #[test]
    fn test_strategy_marks_dummy_positions() {
        let definition = plan(json!([
            { "stage": { "uuid": "s1", "identifier": "deploy", "strategy": { "uuid": "stage_matrix" }, "steps": [
                { "stepGroup": { "uuid": "g1", "identifier": "canary", "strategy": { "uuid": "group_loop" }, "steps": [
                    barrier_step("b1", "sync")
                ] } }
            ] } }
        ]));

        let positions = definition.extract_barrier_positions().unwrap();
        let position = &positions["sync"][0];

        assert!(position.is_dummy_position);
        assert_eq!(position.strategy_setup_id.as_deref(), Some("group_loop"));
        assert_eq!(position.all_strategy_setup_ids, vec!["stage_matrix", "group_loop"]);
        assert_eq!(position.strategy_node_type, Some(PositionType::StepGroup));

        let setup = definition.extract_barrier_setup_info().unwrap();
        let sync = setup.iter().find(|s| s.identifier == "sync").unwrap();
        assert_eq!(sync.strategy_setup_ids.len(), 2);
    }

    #[test]
    fn test_rollback_step_groups_are_flagged() {
        let definition = plan(json!([
            { "stage": { "uuid": "s1", "identifier": "deploy", "steps": [], "rollbackSteps": [
                { "stepGroup": { "uuid": "g1", "identifier": "undo", "steps": [ barrier_step("b1", "sync") ] } },
                barrier_step("b2", "sync")
            ] } }
        ]));

        let positions = &definition.barrier_layout().unwrap().positions["sync"];
        assert!(positions[0].step_group_rollback);
        assert!(!positions[1].step_group_rollback);
    }

    #[test]
    fn test_structural_errors_fail_fast() {
        let undeclared = plan(json!([
            { "stage": { "uuid": "s1", "identifier": "a", "steps": [ barrier_step("b1", "nope") ] } }
        ]));
        assert!(matches!(
            undeclared.barrier_layout(),
            Err(BarrierError::InvalidDefinition(msg)) if msg.contains("undeclared")
        ));

        let unreferenced = plan(json!([
            { "stage": { "uuid": "s1", "identifier": "a", "steps": [
                { "step": { "uuid": "b1", "identifier": "b1", "type": "Barrier" } }
            ] } }
        ]));
        assert!(unreferenced.barrier_layout().is_err());

        let duplicate: PlanDefinition = serde_json::from_value(json!({
            "flowControl": { "barriers": [
                { "identifier": "sync", "name": "A" },
                { "identifier": "sync", "name": "B" }
            ] }
        }))
        .unwrap();
        assert!(duplicate.barrier_layout().is_err());
    }

    #[test]
    fn test_layout_builds_standing_instances() {
        let definition = plan(json!([
            { "stage": { "uuid": "s1", "identifier": "a", "steps": [ barrier_step("b1", "sync") ] } }
        ]));
        let instances = definition.barrier_layout().unwrap().instances("plan-1");

        assert_eq!(instances.len(), 2);
        let sync = instances.iter().find(|i| i.identifier == "sync").unwrap();
        assert_eq!(sync.plan_execution_id, "plan-1");
        assert_eq!(sync.position_info.plan_execution_id, "plan-1");
        assert_eq!(sync.positions().len(), 1);
    }
}
