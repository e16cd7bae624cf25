//! Barrier service: the entry point used by the execution layer.

use tracing::{instrument, warn};

use super::error::BarrierError;
use super::machine::{BarrierStateMachine, Evaluation};
use super::registry::WorkflowDefinitionSource;
use super::types::{
    BarrierExecutionInstance, BarrierId, BarrierPosition, BarrierState, PositionType,
    PositionUpdate, StageDetail,
};
use crate::infrastructure::audit::{log_audit, AuditEvent};
use crate::store::BarrierStore;

/// Strategy node type name for stages, as reported by the execution layer.
pub const STAGE_NODE_TYPE: &str = "stage";
/// Strategy node type name for step groups, as reported by the execution layer.
pub const STEP_GROUP_NODE_TYPE: &str = "stepGroup";

/// A barrier step that started executing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BarrierStepRegistration {
    /// Definition-time id of the step.
    pub step_setup_id: String,
    /// Referenced barrier identifier.
    pub barrier_identifier: String,
    /// Referenced barrier display name.
    pub barrier_name: String,
    /// Owning plan execution.
    pub plan_execution_id: String,
    /// Node type of the enclosing strategy, if any.
    pub parent_strategy_node_type: Option<String>,
    /// Definition-time id of the stage.
    pub stage_setup_id: String,
    /// Definition-time id of the step group.
    pub step_group_setup_id: Option<String>,
    /// Nearest enclosing strategy.
    pub strategy_setup_id: Option<String>,
    /// Every enclosing strategy, outermost first.
    pub all_strategy_setup_ids: Vec<String>,
}

impl BarrierStepRegistration {
    fn strategy_node_type(&self) -> Option<PositionType> {
        match self.parent_strategy_node_type.as_deref() {
            None | Some("") => None,
            Some(STAGE_NODE_TYPE) => Some(PositionType::Stage),
            Some(STEP_GROUP_NODE_TYPE) => Some(PositionType::StepGroup),
            Some(other) => {
                warn!(
                    node_type = other,
                    step_setup_id = %self.step_setup_id,
                    barrier = %self.barrier_identifier,
                    plan_execution_id = %self.plan_execution_id,
                    "Strategy node type is neither stage nor step group, ignoring it"
                );
                None
            }
        }
    }

    /// Single-position instance describing this step.
    #[must_use]
    pub fn to_instance(&self) -> BarrierExecutionInstance {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        let strategy_setup_id = non_empty(&self.strategy_setup_id);
        let position = BarrierPosition {
            stage_setup_id: self.stage_setup_id.clone(),
            step_group_setup_id: non_empty(&self.step_group_setup_id),
            step_setup_id: self.step_setup_id.clone(),
            is_dummy_position: strategy_setup_id.is_some(),
            strategy_setup_id,
            all_strategy_setup_ids: self.all_strategy_setup_ids.clone(),
            strategy_node_type: self.strategy_node_type(),
            ..BarrierPosition::default()
        };

        BarrierExecutionInstance::new(
            self.barrier_name.clone(),
            self.barrier_identifier.clone(),
            self.plan_execution_id.clone(),
        )
        .with_stage(StageDetail::new(self.stage_setup_id.clone()))
        .with_strategy_setup_ids(self.all_strategy_setup_ids.iter().cloned())
        .with_position(position)
    }
}

/// Registration, position tracking and evaluation of barriers.
#[derive(Clone)]
pub struct BarrierService {
    machine: BarrierStateMachine,
    evaluate_on_update: bool,
}

impl BarrierService {
    /// Creates a service that evaluates touched barriers right after each
    /// position update.
    #[must_use]
    pub fn new(machine: BarrierStateMachine) -> Self {
        Self {
            machine,
            evaluate_on_update: true,
        }
    }

    /// Enables or disables evaluation after position updates. When disabled
    /// only the poller resolves barriers.
    #[must_use]
    pub fn with_evaluate_on_update(mut self, enabled: bool) -> Self {
        self.evaluate_on_update = enabled;
        self
    }

    /// Instance store.
    #[must_use]
    pub fn store(&self) -> &BarrierStore {
        self.machine.store()
    }

    /// State machine.
    #[must_use]
    pub fn machine(&self) -> &BarrierStateMachine {
        &self.machine
    }

    /// Creates or merges one instance per barrier of `definition` for a new
    /// plan execution.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::InvalidDefinition`] for structural errors
    /// before anything is written, or the first store error.
    #[instrument(skip(self, definition))]
    pub async fn register_plan(
        &self,
        definition: &dyn WorkflowDefinitionSource,
        plan_execution_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        let layout = definition.barrier_layout()?;
        let mut registered = Vec::with_capacity(layout.setup_info.len());
        for instance in layout.instances(plan_execution_id) {
            registered.push(self.store().upsert(&instance).await?);
        }
        Ok(registered)
    }

    /// Merges the position of a barrier step that started executing.
    ///
    /// # Errors
    ///
    /// Returns a retryable error if the merge lock is contended.
    #[instrument(
        skip_all,
        fields(
            barrier = %registration.barrier_identifier,
            plan_execution_id = %registration.plan_execution_id
        )
    )]
    pub async fn register_barrier_step(
        &self,
        registration: &BarrierStepRegistration,
    ) -> Result<BarrierExecutionInstance, BarrierError> {
        Ok(self.store().upsert(&registration.to_instance()).await?)
    }

    /// Records a runtime id and returns the touched instances as written.
    ///
    /// When evaluation on update is enabled, each touched barrier is then
    /// evaluated; evaluation failures are logged and left to the poller.
    ///
    /// # Errors
    ///
    /// Returns a store error if the update fails.
    pub async fn update_position(
        &self,
        update: &PositionUpdate,
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        let touched = self.store().update_position(update).await?;
        if self.evaluate_on_update {
            for instance in &touched {
                if let Err(e) = self.machine.evaluate(instance).await {
                    warn!(barrier_id = %instance.id, error = %e, "Evaluation after update failed");
                }
            }
        }
        Ok(touched)
    }

    /// Moves a `Standing` barrier to a terminal state without evaluating it
    /// and without notifying waiters.
    ///
    /// # Errors
    ///
    /// Returns a store error for a non-terminal target or a failed write.
    pub async fn update_state(
        &self,
        id: &BarrierId,
        state: BarrierState,
    ) -> Result<bool, BarrierError> {
        Ok(self.store().update_state(id, state).await?)
    }

    /// Evaluates barrier `id` now.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::NotFound`] for an unknown id.
    pub async fn evaluate(&self, id: &BarrierId) -> Result<Evaluation, BarrierError> {
        match self.store().find_by_id(id).await? {
            Some(instance) => Ok(self.machine.evaluate(&instance).await?),
            None => Err(BarrierError::NotFound(id.to_string())),
        }
    }

    /// Loads barrier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::NotFound`] for an unknown id.
    pub async fn get(&self, id: &BarrierId) -> Result<BarrierExecutionInstance, BarrierError> {
        self.store()
            .find_by_id(id)
            .await?
            .ok_or_else(|| BarrierError::NotFound(id.to_string()))
    }

    /// Barrier `identifier` inside `plan_execution_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn find_by_identifier_and_plan_execution_id(
        &self,
        identifier: &str,
        plan_execution_id: &str,
    ) -> Result<Option<BarrierExecutionInstance>, BarrierError> {
        Ok(self
            .store()
            .find_by_identifier_and_plan_execution_id(identifier, plan_execution_id)
            .await?)
    }

    /// Barriers with a member at the given structural position.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn find_by_position(
        &self,
        plan_execution_id: &str,
        position_type: PositionType,
        position_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        Ok(self
            .store()
            .find_by_position(plan_execution_id, position_type, position_setup_id)
            .await?)
    }

    /// Barriers containing barrier step `step_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn find_by_plan_node_id(
        &self,
        plan_execution_id: &str,
        step_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        Ok(self
            .store()
            .find_by_plan_node_id(plan_execution_id, step_setup_id)
            .await?)
    }

    /// Barriers with a member in stage `stage_identifier`, in any of
    /// `states` (all states when empty).
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn find_by_stage_identifier(
        &self,
        plan_execution_id: &str,
        stage_identifier: &str,
        states: &[BarrierState],
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        Ok(self
            .store()
            .find_by_stage_identifier(plan_execution_id, stage_identifier, states)
            .await?)
    }

    /// Barriers enclosing strategy `strategy_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn find_by_strategy_setup_id(
        &self,
        plan_execution_id: &str,
        strategy_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, BarrierError> {
        Ok(self
            .store()
            .find_by_strategy_setup_id(plan_execution_id, strategy_setup_id)
            .await?)
    }

    /// Whether any barrier encloses strategy `strategy_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the lookup fails.
    pub async fn exists_by_strategy_setup_id(
        &self,
        plan_execution_id: &str,
        strategy_setup_id: &str,
    ) -> Result<bool, BarrierError> {
        Ok(self
            .store()
            .exists_by_strategy_setup_id(plan_execution_id, strategy_setup_id)
            .await?)
    }

    /// Replaces the positions of a barrier after strategy expansion.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Store`] wrapping not-found or lock errors.
    pub async fn replace_positions(
        &self,
        identifier: &str,
        plan_execution_id: &str,
        positions: &[BarrierPosition],
        strategy_setup_id: &str,
        concurrency: u32,
    ) -> Result<BarrierExecutionInstance, BarrierError> {
        Ok(self
            .store()
            .replace_positions(
                identifier,
                plan_execution_id,
                positions,
                strategy_setup_id,
                concurrency,
            )
            .await?)
    }

    /// Deletes every barrier of the given plan executions.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails.
    pub async fn delete_all_for_plan_executions(
        &self,
        plan_execution_ids: &[String],
    ) -> Result<u64, BarrierError> {
        let deleted = self
            .store()
            .delete_all_for_plan_executions(plan_execution_ids)
            .await?;
        if deleted > 0 {
            log_audit(&AuditEvent::PlanExecutionsPurged {
                plan_execution_ids: plan_execution_ids.to_vec(),
                barriers_deleted: deleted,
            });
        }
        Ok(deleted)
    }
}
