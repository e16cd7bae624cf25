//! End-to-end barrier scenarios against the assembled kernel.
//!
//! Statuses are written to the `execution_status` table the way the
//! execution layer would, and releases are read back from the outbox.

#![allow(missing_docs)]

use anyhow::Result;
use barrier_kernel::barrier::{
    BarrierExecutionInstance, BarrierPosition, BarrierState, BarrierStepRegistration,
    ExecutionStatus, PlanDefinition, PositionType, PositionUpdate,
};
use barrier_kernel::infrastructure::config::Settings;
use barrier_kernel::store::OutboxEntry;
use barrier_kernel::BarrierKernel;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

const PLAN: &str = "plan-1";

async fn kernel() -> Result<BarrierKernel> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    let settings = Settings::from_toml("[poller]\nenabled = false")?;
    BarrierKernel::with_pool(pool, &settings).await
}

/// Two parallel stages meeting at `sync`; the second reaches it through a
/// step group.
fn fan_in_plan() -> PlanDefinition {
    serde_json::from_value(json!({
        "flowControl": { "barriers": [ { "identifier": "sync", "name": "Sync" } ] },
        "stages": [ { "parallel": [
            { "stage": { "uuid": "s1", "identifier": "build", "steps": [
                { "step": { "uuid": "b1", "identifier": "wait_build", "type": "Barrier", "barrierRef": "sync" } }
            ] } },
            { "stage": { "uuid": "s2", "identifier": "test", "steps": [
                { "stepGroup": { "uuid": "g2", "identifier": "checks", "steps": [
                    { "step": { "uuid": "b2", "identifier": "wait_test", "type": "Barrier", "barrierRef": "sync" } }
                ] } }
            ] } }
        ] } ]
    }))
    .expect("valid plan definition")
}

/// Binds runtime ids for both branches the way the executor reports them.
async fn start_branches(kernel: &BarrierKernel) -> Result<()> {
    let service = kernel.service();
    service
        .update_position(&PositionUpdate::new(PLAN, PositionType::Stage, "s1", "stage-a"))
        .await?;
    service
        .update_position(
            &PositionUpdate::new(PLAN, PositionType::Step, "b1", "step-a").under_stage("stage-a"),
        )
        .await?;
    service
        .update_position(&PositionUpdate::new(PLAN, PositionType::Stage, "s2", "stage-b"))
        .await?;
    service
        .update_position(
            &PositionUpdate::new(PLAN, PositionType::StepGroup, "g2", "group-b")
                .under_stage("stage-b"),
        )
        .await?;
    service
        .update_position(
            &PositionUpdate::new(PLAN, PositionType::Step, "b2", "step-b")
                .under_stage("stage-b")
                .under_step_group("group-b"),
        )
        .await?;
    Ok(())
}

async fn record(kernel: &BarrierKernel, statuses: &[(&str, ExecutionStatus)]) -> Result<()> {
    for (id, status) in statuses {
        kernel.status().record_status(id, *status).await?;
    }
    Ok(())
}

async fn releases(kernel: &BarrierKernel) -> Result<Vec<OutboxEntry>> {
    Ok(kernel.outbox().fetch_after(0, 100).await?)
}

#[tokio::test]
async fn fan_in_releases_once_every_branch_arrives() -> Result<()> {
    let kernel = kernel().await?;
    let registered = kernel.service().register_plan(&fan_in_plan(), PLAN).await?;
    assert_eq!(registered.len(), 1);
    let id = registered[0].id.clone();

    record(
        &kernel,
        &[
            (PLAN, ExecutionStatus::Running),
            ("stage-a", ExecutionStatus::Running),
            ("stage-b", ExecutionStatus::Running),
            ("group-b", ExecutionStatus::Running),
            ("step-a", ExecutionStatus::AsyncWaiting),
        ],
    )
    .await?;
    start_branches(&kernel).await?;

    let barrier = kernel.service().get(&id).await?;
    assert_eq!(barrier.barrier_state, BarrierState::Standing);
    assert!(barrier
        .positions()
        .iter()
        .all(|p| p.step_runtime_id.is_some() && p.stage_runtime_id.is_some()));
    assert!(releases(&kernel).await?.is_empty());

    record(&kernel, &[("step-b", ExecutionStatus::AsyncWaiting)]).await?;
    let evaluation = kernel.service().evaluate(&id).await?;

    assert!(evaluation.transitioned);
    assert_eq!(evaluation.state, BarrierState::Down);
    let released = releases(&kernel).await?;
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].barrier_id, id);
    assert!(!released[0].outcome.failed);
    Ok(())
}

#[tokio::test]
async fn aborted_branch_endures_barrier() -> Result<()> {
    let kernel = kernel().await?;
    let id = kernel.service().register_plan(&fan_in_plan(), PLAN).await?[0]
        .id
        .clone();

    record(
        &kernel,
        &[
            (PLAN, ExecutionStatus::Running),
            ("stage-a", ExecutionStatus::Running),
            ("step-a", ExecutionStatus::AsyncWaiting),
            ("stage-b", ExecutionStatus::Aborted),
        ],
    )
    .await?;
    start_branches(&kernel).await?;

    let barrier = kernel.service().get(&id).await?;
    assert_eq!(barrier.barrier_state, BarrierState::Endure);
    let released = releases(&kernel).await?;
    assert_eq!(released.len(), 1);
    assert!(released[0].outcome.failed);
    assert!(!released[0].outcome.timed_out);
    assert_eq!(released[0].outcome.message.as_deref(), Some("barrier abandoned"));
    Ok(())
}

#[tokio::test]
async fn abandoned_branch_dominates_expired_branch() -> Result<()> {
    let kernel = kernel().await?;
    let id = kernel.service().register_plan(&fan_in_plan(), PLAN).await?[0]
        .id
        .clone();
    start_branches(&kernel).await?;

    record(
        &kernel,
        &[
            (PLAN, ExecutionStatus::Running),
            ("stage-a", ExecutionStatus::Running),
            ("step-a", ExecutionStatus::Expired),
            ("stage-b", ExecutionStatus::Running),
            ("group-b", ExecutionStatus::Running),
            ("step-b", ExecutionStatus::Failed),
        ],
    )
    .await?;
    let evaluation = kernel.service().evaluate(&id).await?;

    assert_eq!(evaluation.state, BarrierState::Endure);
    Ok(())
}

#[tokio::test]
async fn expired_branch_times_barrier_out() -> Result<()> {
    let kernel = kernel().await?;
    let id = kernel.service().register_plan(&fan_in_plan(), PLAN).await?[0]
        .id
        .clone();
    start_branches(&kernel).await?;

    record(
        &kernel,
        &[
            (PLAN, ExecutionStatus::Running),
            ("step-a", ExecutionStatus::AsyncWaiting),
            ("step-b", ExecutionStatus::Expired),
        ],
    )
    .await?;
    let evaluation = kernel.service().evaluate(&id).await?;

    assert_eq!(evaluation.state, BarrierState::TimedOut);
    let released = releases(&kernel).await?;
    assert!(released[0].outcome.timed_out);
    assert_eq!(released[0].outcome.message.as_deref(), Some("barrier timed out"));
    Ok(())
}

#[tokio::test]
async fn concurrent_evaluations_notify_once() -> Result<()> {
    let kernel = kernel().await?;
    let id = kernel.service().register_plan(&fan_in_plan(), PLAN).await?[0]
        .id
        .clone();
    start_branches(&kernel).await?;
    record(
        &kernel,
        &[
            ("step-a", ExecutionStatus::AsyncWaiting),
            ("step-b", ExecutionStatus::Succeeded),
        ],
    )
    .await?;

    let snapshot = kernel.service().get(&id).await?;
    assert_eq!(snapshot.barrier_state, BarrierState::Standing);
    let machine = kernel.service().machine();
    let (first, second) = tokio::join!(machine.evaluate(&snapshot), machine.evaluate(&snapshot));
    let (first, second) = (first?, second?);

    assert!(first.transitioned ^ second.transitioned);
    assert_eq!(first.state, BarrierState::Down);
    assert_eq!(second.state, BarrierState::Down);
    assert_eq!(releases(&kernel).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn registration_is_idempotent() -> Result<()> {
    let kernel = kernel().await?;
    let first = kernel.service().register_plan(&fan_in_plan(), PLAN).await?;
    let second = kernel.service().register_plan(&fan_in_plan(), PLAN).await?;

    assert_eq!(first[0].id, second[0].id);
    assert_eq!(second[0].positions().len(), 2);

    let step = BarrierStepRegistration {
        step_setup_id: "b1".into(),
        barrier_identifier: "sync".into(),
        barrier_name: "Sync".into(),
        plan_execution_id: PLAN.into(),
        stage_setup_id: "s1".into(),
        ..BarrierStepRegistration::default()
    };
    let merged = kernel.service().register_barrier_step(&step).await?;
    assert_eq!(merged.id, first[0].id);
    assert_eq!(merged.positions().len(), 2);
    Ok(())
}

#[tokio::test]
async fn reregistering_with_runtime_ids_keeps_one_member() -> Result<()> {
    let kernel = kernel().await?;
    let store = kernel.service().store();
    let structural = BarrierExecutionInstance::new("Sync", "sync", PLAN)
        .with_position(BarrierPosition::new("s1", "b1"));
    let created = store.upsert(&structural).await?;

    let started = BarrierExecutionInstance::new("Sync", "sync", PLAN).with_position(
        BarrierPosition::new("s1", "b1").with_runtime_ids(Some("stage-a"), None, Some("step-a")),
    );
    let merged = store.upsert(&started).await?;
    assert_eq!(merged.positions().len(), 1);

    record(
        &kernel,
        &[
            (PLAN, ExecutionStatus::Running),
            ("stage-a", ExecutionStatus::Running),
            ("step-a", ExecutionStatus::AsyncWaiting),
        ],
    )
    .await?;
    let evaluation = kernel.service().evaluate(&created.id).await?;

    assert_eq!(evaluation.state, BarrierState::Down);
    assert_eq!(releases(&kernel).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn rollback_step_group_is_elided_from_the_tree() -> Result<()> {
    let kernel = kernel().await?;
    let definition: PlanDefinition = serde_json::from_value(json!({
        "flowControl": { "barriers": [ { "identifier": "undo", "name": "Undo" } ] },
        "stages": [
            { "stage": { "uuid": "s1", "identifier": "deploy", "steps": [], "rollbackSteps": [
                { "stepGroup": { "uuid": "g1", "identifier": "revert", "steps": [
                    { "step": { "uuid": "b1", "identifier": "wait", "type": "Barrier", "barrierRef": "undo" } }
                ] } }
            ] } }
        ]
    }))?;
    let id = kernel.service().register_plan(&definition, PLAN).await?[0]
        .id
        .clone();
    assert!(kernel.service().get(&id).await?.positions()[0].step_group_rollback);

    // A failed rollback group would abandon the barrier if it were a tree node.
    record(
        &kernel,
        &[
            ("group-r", ExecutionStatus::Failed),
            ("step-r", ExecutionStatus::AsyncWaiting),
        ],
    )
    .await?;
    kernel
        .service()
        .update_position(&PositionUpdate::new(PLAN, PositionType::Stage, "s1", "stage-r"))
        .await?;
    kernel
        .service()
        .update_position(&PositionUpdate::new(PLAN, PositionType::StepGroup, "g1", "group-r"))
        .await?;
    kernel
        .service()
        .update_position(&PositionUpdate::new(PLAN, PositionType::Step, "b1", "step-r"))
        .await?;

    assert_eq!(kernel.service().get(&id).await?.barrier_state, BarrierState::Down);
    Ok(())
}

#[tokio::test]
async fn purge_removes_plan_barriers() -> Result<()> {
    let kernel = kernel().await?;
    kernel.service().register_plan(&fan_in_plan(), PLAN).await?;
    kernel.service().register_plan(&fan_in_plan(), "plan-2").await?;

    let deleted = kernel
        .service()
        .delete_all_for_plan_executions(&[PLAN.to_string()])
        .await?;

    assert_eq!(deleted, 1);
    assert!(kernel
        .service()
        .find_by_identifier_and_plan_execution_id("sync", PLAN)
        .await?
        .is_none());
    assert!(kernel
        .service()
        .find_by_identifier_and_plan_execution_id("sync", "plan-2")
        .await?
        .is_some());
    Ok(())
}
