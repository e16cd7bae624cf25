//! Shared test utilities for integration tests.
//!
//! Provides a kernel over a file-backed database in a temporary directory
//! and helpers that play the execution layer's part: recording statuses and
//! reporting runtime ids.

#![allow(dead_code)]

use anyhow::Result;
use barrier_kernel::barrier::{
    BarrierExecutionInstance, ExecutionStatus, PlanDefinition, PositionType, PositionUpdate,
};
use barrier_kernel::infrastructure::config::Settings;
use barrier_kernel::store::OutboxEntry;
use barrier_kernel::BarrierKernel;
use serde_json::json;
use std::path::PathBuf;
use tempfile::TempDir;

/// Integration test context providing shared resources.
pub struct IntegrationTestContext {
    /// Temporary directory holding the database file
    pub temp_dir: TempDir,
    /// Assembled kernel
    pub kernel: BarrierKernel,
}

impl IntegrationTestContext {
    /// Creates a context with the poller disabled.
    pub async fn new() -> Result<Self> {
        Self::with_settings("[poller]\nenabled = false").await
    }

    /// Creates a context with extra TOML settings; the database section is
    /// filled in.
    pub async fn with_settings(extra: &str) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let db = temp_dir.path().join("barriers.db");
        let settings = Settings::from_toml(&format!(
            "[database]\nurl = \"sqlite://{}\"\nmax_connections = 4\n\n{extra}",
            db.display()
        ))?;
        let kernel = BarrierKernel::new(&settings).await?;
        Ok(Self { temp_dir, kernel })
    }

    /// Path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("barriers.db")
    }

    /// Records execution statuses as the execution layer would.
    pub async fn record(&self, statuses: &[(&str, ExecutionStatus)]) -> Result<()> {
        for (id, status) in statuses {
            self.kernel.status().record_status(id, *status).await?;
        }
        Ok(())
    }

    /// Reports that a structural element started with `runtime_id`.
    pub async fn started(
        &self,
        plan_execution_id: &str,
        position_type: PositionType,
        setup_id: &str,
        runtime_id: &str,
        stage_runtime_id: Option<&str>,
    ) -> Result<Vec<BarrierExecutionInstance>> {
        let mut update = PositionUpdate::new(plan_execution_id, position_type, setup_id, runtime_id);
        if let Some(stage) = stage_runtime_id {
            update = update.under_stage(stage);
        }
        Ok(self.kernel.service().update_position(&update).await?)
    }

    /// Every release in the outbox, oldest first.
    pub async fn releases(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.kernel.outbox().fetch_after(0, 1000).await?)
    }
}

/// Deploy pipeline: `build` and `test` run in parallel and meet at `ready`;
/// `deploy` then fans out over a strategy and meets at `rollout`.
pub fn pipeline_definition() -> PlanDefinition {
    let barrier = |uuid: &str, barrier: &str| {
        json!({ "step": { "uuid": uuid, "identifier": uuid, "type": "Barrier", "barrierRef": barrier } })
    };
    serde_json::from_value(json!({
        "flowControl": { "barriers": [
            { "identifier": "ready", "name": "Ready" },
            { "identifier": "rollout", "name": "Rollout" }
        ] },
        "stages": [
            { "parallel": [
                { "stage": { "uuid": "build_setup", "identifier": "build", "name": "Build", "steps": [
                    { "step": { "uuid": "compile_setup", "identifier": "compile", "type": "Run" } },
                    barrier("build_ready", "ready")
                ] } },
                { "stage": { "uuid": "test_setup", "identifier": "test", "name": "Test", "steps": [
                    { "stepGroup": { "uuid": "suite_setup", "identifier": "suite", "steps": [
                        barrier("test_ready", "ready")
                    ] } }
                ] } }
            ] },
            { "stage": {
                "uuid": "deploy_setup",
                "identifier": "deploy",
                "name": "Deploy",
                "strategy": { "uuid": "regions" },
                "steps": [ barrier("deploy_rollout", "rollout") ]
            } }
        ]
    }))
    .expect("valid pipeline definition")
}
