//! Barrier synchronisation engine.
//!
//! Registration ([`registry`], [`service`]) declares which structural
//! positions must meet at a barrier, the [`store`](crate::store) binds them
//! to runtime ids as the plan runs, and the [`machine`] resolves each barrier
//! once through its [`forcer`] tree.

/// Barrier-level errors.
pub mod error;
/// Forcer tree and aggregation.
pub mod forcer;
/// State machine driving barriers to a terminal state.
pub mod machine;
/// Release notification contract and in-process notifier.
pub mod notifier;
/// Status proctor and execution-status contract.
pub mod proctor;
/// Workflow definition walker.
pub mod registry;
/// Service facade.
pub mod service;
/// Domain types.
pub mod types;

pub use error::BarrierError;
pub use forcer::{aggregate, build_forcer, Forcer, ForcerId, ForcerLevel, ForcerMetadata, ForcerState};
pub use machine::{BarrierStateMachine, Evaluation};
pub use notifier::{BarrierRelease, BroadcastNotifier, ReleaseNotifier, ReleaseOutcome};
pub use proctor::{ExecutionStatus, ExecutionStatusProctor, ExecutionStatusSource, StatusProctor};
pub use registry::{BarrierLayout, PlanDefinition, PositionRegistry, WorkflowDefinitionSource};
pub use service::{BarrierService, BarrierStepRegistration};
pub use types::{
    BarrierExecutionInstance, BarrierId, BarrierPosition, BarrierPositionInfo, BarrierSetupInfo,
    BarrierState, PositionType, PositionUpdate, StageDetail,
};
