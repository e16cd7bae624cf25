//! Execution-status source over the `execution_status` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;

use super::StoreError;
use crate::barrier::proctor::{ExecutionStatus, ExecutionStatusSource};

/// Reads raw statuses written by the execution layer.
///
/// Plan and node executions share one table keyed by execution id.
#[derive(Clone)]
pub struct SqlStatusSource {
    pool: SqlitePool,
}

impl SqlStatusSource {
    /// Creates a source on `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records the latest status of an execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    #[instrument(skip(self))]
    pub async fn record_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO execution_status (execution_id, status, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (execution_id)
             DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(execution_id)
        .bind(serde_json::to_value(status)?.as_str().unwrap_or_default())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn status(&self, execution_id: &str) -> anyhow::Result<Option<ExecutionStatus>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM execution_status WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|status| {
            status
                .parse::<ExecutionStatus>()
                .map_err(|e| anyhow::anyhow!("unknown execution status {status}: {e}"))
        })
        .transpose()
    }
}

#[async_trait]
impl ExecutionStatusSource for SqlStatusSource {
    async fn plan_status(&self, plan_execution_id: &str) -> anyhow::Result<Option<ExecutionStatus>> {
        self.status(plan_execution_id).await
    }

    async fn node_status(&self, node_execution_id: &str) -> anyhow::Result<Option<ExecutionStatus>> {
        self.status(node_execution_id).await
    }
}
