//! Schema for the barrier tables.
//!
//! Statements are idempotent and run at start-up.

use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::StoreError;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS barrier_execution_instances (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        identifier TEXT NOT NULL,
        plan_execution_id TEXT NOT NULL,
        barrier_state TEXT NOT NULL DEFAULT 'STANDING',
        setup_name TEXT NOT NULL,
        setup_identifier TEXT NOT NULL,
        position_plan_execution_id TEXT NOT NULL,
        next_iteration INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (identifier, plan_execution_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_barrier_state_next_iteration
        ON barrier_execution_instances (barrier_state, next_iteration)",
    "CREATE INDEX IF NOT EXISTS idx_barrier_plan_execution
        ON barrier_execution_instances (plan_execution_id, barrier_state)",
    "CREATE TABLE IF NOT EXISTS barrier_stages (
        instance_id TEXT NOT NULL,
        identifier TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (instance_id, identifier, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_barrier_stages_identifier
        ON barrier_stages (identifier)",
    "CREATE TABLE IF NOT EXISTS barrier_strategy_setup_ids (
        instance_id TEXT NOT NULL,
        strategy_setup_id TEXT NOT NULL,
        PRIMARY KEY (instance_id, strategy_setup_id)
    )",
    "CREATE TABLE IF NOT EXISTS barrier_positions (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        stage_setup_id TEXT NOT NULL,
        step_group_setup_id TEXT,
        step_setup_id TEXT NOT NULL,
        strategy_setup_id TEXT,
        all_strategy_setup_ids TEXT NOT NULL DEFAULT '[]',
        stage_runtime_id TEXT,
        step_group_runtime_id TEXT,
        step_runtime_id TEXT,
        step_group_rollback INTEGER NOT NULL DEFAULT 0,
        is_dummy_position INTEGER NOT NULL DEFAULT 0,
        strategy_node_type TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_barrier_positions_instance
        ON barrier_positions (instance_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_barrier_positions_step
        ON barrier_positions (step_setup_id)",
    "CREATE TABLE IF NOT EXISTS barrier_strategy_concurrency (
        instance_id TEXT NOT NULL,
        strategy_setup_id TEXT NOT NULL,
        concurrency INTEGER NOT NULL,
        PRIMARY KEY (instance_id, strategy_setup_id)
    )",
    "CREATE TABLE IF NOT EXISTS named_locks (
        name TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS execution_status (
        execution_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS barrier_releases (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        barrier_id TEXT NOT NULL,
        failed INTEGER NOT NULL,
        timed_out INTEGER NOT NULL,
        message TEXT,
        created_at INTEGER NOT NULL
    )",
];

/// Creates every barrier table and index that does not exist yet.
///
/// # Errors
///
/// Returns an error if any statement fails.
#[instrument(skip(pool))]
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "Barrier schema ready");
    Ok(())
}
