//! `SQLite`-backed barrier instance store.
//!
//! Every mutation of a [`BarrierExecutionInstance`] goes through
//! [`BarrierStore`]. Positions live one per row so that position updates can
//! target only the matching rows and state transitions can be conditional
//! single-row writes.

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnection, SqlitePool, SqliteRow},
    QueryBuilder, Row, Sqlite,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::barrier::types::{
    BarrierExecutionInstance, BarrierId, BarrierPosition, BarrierPositionInfo, BarrierSetupInfo,
    BarrierState, PositionType, PositionUpdate, StageDetail,
};
use crate::store::lock::{LockTimeouts, NamedLocker, SqlLocker};
use crate::store::retry::RetryPolicy;

/// Prefix of the named lock serialising merges of one barrier identifier.
pub const UPSERT_LOCK_PREFIX: &str = "BARRIER_UPSERT_LOCK_";

const INSTANCE_COLUMNS: &str = "id, name, identifier, plan_execution_id, barrier_state, \
     setup_name, setup_identifier, position_plan_execution_id, created_at, updated_at";

const POSITION_COLUMNS: &str = "stage_setup_id, step_group_setup_id, step_setup_id, \
     strategy_setup_id, all_strategy_setup_ids, stage_runtime_id, step_group_runtime_id, \
     step_runtime_id, step_group_rollback, is_dummy_position, strategy_node_type";

/// Errors that can occur when using the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database-related error.
    #[error("Database Error: {0}")]
    DbError(#[from] sqlx::Error),
    /// A JSON column could not be encoded or decoded.
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A named lock stayed held by someone else for the whole wait.
    #[error("Lock {key} unavailable after {waited_ms}ms")]
    LockUnavailable {
        /// Lock name.
        key: String,
        /// Time spent waiting.
        waited_ms: u64,
    },
    /// The requested state cannot be reached by a transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Required current state.
        from: BarrierState,
        /// Requested state.
        to: BarrierState,
    },
    /// No instance matched.
    #[error("Barrier instance not found: {0}")]
    NotFound(String),
    /// A stored value is outside its domain.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Whether the same call may succeed if repeated.
    ///
    /// Covers pool exhaustion, I/O failures and `SQLITE_BUSY` / `SQLITE_LOCKED`.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DbError(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            Self::DbError(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

/// Barrier instance store.
#[derive(Clone)]
pub struct BarrierStore {
    pool: SqlitePool,
    locker: Arc<dyn NamedLocker>,
    retry: RetryPolicy,
    upsert_lock: LockTimeouts,
}

impl BarrierStore {
    /// Creates a store on `pool` with a table-backed locker and default
    /// retry and lock settings.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            locker: Arc::new(SqlLocker::new(pool.clone())),
            pool,
            retry: RetryPolicy::default(),
            upsert_lock: LockTimeouts::default(),
        }
    }

    /// Replaces the named-lock provider.
    #[must_use]
    pub fn with_locker(mut self, locker: Arc<dyn NamedLocker>) -> Self {
        self.locker = locker;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the merge lock timeouts.
    #[must_use]
    pub fn with_upsert_lock(mut self, upsert_lock: LockTimeouts) -> Self {
        self.upsert_lock = upsert_lock;
        self
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts `instance`, or merges it into the instance already stored
    /// for its `(identifier, plan_execution_id)`.
    ///
    /// Merging unions stages, strategy ids, concurrency entries and
    /// positions. A position matching a stored member only fills that
    /// member's empty runtime ids. It never changes the stored state. Runs under the named
    /// lock for the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockUnavailable`] when the lock cannot be taken,
    /// or a database error once retries are spent.
    #[instrument(
        skip(self, instance),
        fields(identifier = %instance.identifier, plan_execution_id = %instance.plan_execution_id)
    )]
    pub async fn upsert(
        &self,
        instance: &BarrierExecutionInstance,
    ) -> Result<BarrierExecutionInstance, StoreError> {
        let key = format!("{UPSERT_LOCK_PREFIX}{}", instance.identifier);
        let lock = self
            .locker
            .acquire(&key, self.upsert_lock.wait, self.upsert_lock.hold)
            .await?;

        let merged = self
            .retry
            .run("upsert", move || self.merge(instance))
            .await;

        if let Err(e) = self.locker.release(lock).await {
            warn!(lock_key = %key, error = %e, "Failed to release upsert lock");
        }
        merged
    }

    async fn merge(
        &self,
        incoming: &BarrierExecutionInstance,
    ) -> Result<BarrierExecutionInstance, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp_millis();

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM barrier_execution_instances
             WHERE identifier = ? AND plan_execution_id = ?",
        )
        .bind(&incoming.identifier)
        .bind(&incoming.plan_execution_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = if let Some(id) = existing {
            sqlx::query("UPDATE barrier_execution_instances SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            id
        } else {
            sqlx::query(
                "INSERT INTO barrier_execution_instances
                    (id, name, identifier, plan_execution_id, barrier_state, setup_name,
                     setup_identifier, position_plan_execution_id, next_iteration,
                     created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(incoming.id.as_str())
            .bind(&incoming.name)
            .bind(&incoming.identifier)
            .bind(&incoming.plan_execution_id)
            .bind(BarrierState::Standing.as_str())
            .bind(&incoming.setup_info.name)
            .bind(&incoming.setup_info.identifier)
            .bind(&incoming.position_info.plan_execution_id)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            debug!(barrier_id = %incoming.id, "Barrier instance created");
            incoming.id.as_str().to_string()
        };

        insert_setup(&mut tx, &id, &incoming.setup_info).await?;
        for (strategy_id, concurrency) in &incoming.strategy_concurrency {
            sqlx::query(
                "INSERT OR IGNORE INTO barrier_strategy_concurrency
                    (instance_id, strategy_setup_id, concurrency)
                 VALUES (?, ?, ?)",
            )
            .bind(&id)
            .bind(strategy_id)
            .bind(i64::from(*concurrency))
            .execute(&mut *tx)
            .await?;
        }

        let mut stored = load_position_rows(&mut tx, &id).await?;
        let mut ordinal = i64::try_from(stored.len()).unwrap_or(i64::MAX);
        for position in incoming.positions() {
            let matched = stored
                .iter()
                .position(|(_, p)| p.is_same_member(position) && p.covers_runtime_ids(position))
                .or_else(|| stored.iter().position(|(_, p)| p.is_same_member(position)));
            match matched {
                Some(index) => {
                    let (row_id, member) = &mut stored[index];
                    if member.fill_runtime_ids(position) {
                        fill_runtime_ids(&mut tx, *row_id, member).await?;
                    }
                }
                None => {
                    let row_id = insert_position(&mut tx, &id, ordinal, position).await?;
                    stored.push((row_id, position.clone()));
                    ordinal += 1;
                }
            }
        }

        let merged = load_instance(&mut tx, &id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        tx.commit().await?;
        Ok(merged)
    }

    /// Records a runtime id on every matching position of the plan
    /// execution and returns the instances that changed.
    ///
    /// Only empty runtime fields are written. Stage updates skip positions
    /// owned by a strategy; step-group updates skip positions owned by a
    /// step-group strategy. Parent runtime ids, when present, must match a
    /// stored parent id or fill an empty one, so updates may arrive in any
    /// order.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    #[instrument(
        skip(self, update),
        fields(
            plan_execution_id = %update.plan_execution_id,
            position_type = %update.position_type,
            position_setup_id = %update.position_setup_id
        )
    )]
    pub async fn update_position(
        &self,
        update: &PositionUpdate,
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let touched = self
            .retry
            .run("update_position", move || self.apply_position_update(update))
            .await?;
        debug!(touched = touched.len(), "Position update applied");
        Ok(touched)
    }

    async fn apply_position_update(
        &self,
        update: &PositionUpdate,
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let position_type = update.position_type;
        let runtime_column = position_type.runtime_column();
        let stage_parent = update
            .stage_execution_id
            .as_deref()
            .filter(|_| position_type != PositionType::Stage);
        let step_group_parent = update
            .step_group_execution_id
            .as_deref()
            .filter(|_| position_type == PositionType::Step);

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE barrier_positions SET {runtime_column} = "
        ));
        query.push_bind(update.position_execution_id.as_str());
        // A child update may land before its parent's; it fills the parent
        // under the same ownership rules a direct parent update follows.
        if let Some(stage) = stage_parent {
            query.push(
                ", stage_runtime_id = CASE WHEN stage_runtime_id IS NULL \
                 AND strategy_node_type IS NULL THEN ",
            );
            query.push_bind(stage);
            query.push(" ELSE stage_runtime_id END");
        }
        if let Some(step_group) = step_group_parent {
            query.push(
                ", step_group_runtime_id = CASE WHEN step_group_runtime_id IS NULL \
                 AND (strategy_node_type IS NULL OR strategy_node_type <> ",
            );
            query.push_bind(PositionType::StepGroup.as_str());
            query.push(") THEN ");
            query.push_bind(step_group);
            query.push(" ELSE step_group_runtime_id END");
        }
        query.push(format!(
            " WHERE {runtime_column} IS NULL AND {} = ",
            position_type.setup_column()
        ));
        query.push_bind(update.position_setup_id.as_str());
        query.push(
            " AND instance_id IN (SELECT id FROM barrier_execution_instances \
             WHERE plan_execution_id = ",
        );
        query.push_bind(update.plan_execution_id.as_str());
        query.push(")");

        match position_type {
            PositionType::Stage => {
                query.push(" AND strategy_node_type IS NULL");
            }
            PositionType::StepGroup => {
                query.push(" AND (strategy_node_type IS NULL OR strategy_node_type <> ");
                query.push_bind(PositionType::StepGroup.as_str());
                query.push(")");
            }
            PositionType::Step => {}
        }
        if let Some(stage) = stage_parent {
            query.push(" AND (stage_runtime_id IS NULL OR stage_runtime_id = ");
            query.push_bind(stage);
            query.push(")");
        }
        if let Some(step_group) = step_group_parent {
            query.push(" AND (step_group_runtime_id IS NULL OR step_group_runtime_id = ");
            query.push_bind(step_group);
            query.push(")");
        }
        query.push(" RETURNING instance_id");

        let mut tx = self.pool.begin().await?;
        let rows: Vec<String> = query.build_query_scalar().fetch_all(&mut *tx).await?;
        let ids: BTreeSet<String> = rows.into_iter().collect();

        let now = Utc::now().timestamp_millis();
        let mut touched = Vec::with_capacity(ids.len());
        for id in &ids {
            sqlx::query("UPDATE barrier_execution_instances SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let Some(instance) = load_instance(&mut tx, id).await? {
                touched.push(instance);
            }
        }
        tx.commit().await?;
        Ok(touched)
    }

    /// Moves a `Standing` instance to the terminal `state`.
    ///
    /// Returns `false` when the instance had already left `Standing` or does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidStateTransition`] when `state` is
    /// `Standing`, or a database error once retries are spent.
    #[instrument(skip_all, fields(barrier_id = %id, state = %state))]
    pub async fn update_state(
        &self,
        id: &BarrierId,
        state: BarrierState,
    ) -> Result<bool, StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::InvalidStateTransition {
                from: BarrierState::Standing,
                to: state,
            });
        }

        let transitioned = self
            .retry
            .run("update_state", move || async move {
                let result = sqlx::query(
                    "UPDATE barrier_execution_instances
                     SET barrier_state = ?, updated_at = ?
                     WHERE id = ? AND barrier_state = ?",
                )
                .bind(state.as_str())
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_str())
                .bind(BarrierState::Standing.as_str())
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() == 1)
            })
            .await?;

        if !transitioned {
            debug!("Barrier already resolved, transition skipped");
        }
        Ok(transitioned)
    }

    /// Loads an instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no instance has `id`.
    pub async fn get(&self, id: &BarrierId) -> Result<BarrierExecutionInstance, StoreError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Loads an instance if it exists.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_id(
        &self,
        id: &BarrierId,
    ) -> Result<Option<BarrierExecutionInstance>, StoreError> {
        self.retry
            .run("find_by_id", move || async move {
                let mut conn = self.pool.acquire().await?;
                load_instance(&mut conn, id.as_str()).await
            })
            .await
    }

    /// Instance of barrier `identifier` inside `plan_execution_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_identifier_and_plan_execution_id(
        &self,
        identifier: &str,
        plan_execution_id: &str,
    ) -> Result<Option<BarrierExecutionInstance>, StoreError> {
        let ids = self
            .find_ids(
                "find_by_identifier",
                "SELECT id FROM barrier_execution_instances
                 WHERE identifier = ? AND plan_execution_id = ?",
                &[identifier, plan_execution_id],
            )
            .await?;
        Ok(self.load_all(ids).await?.into_iter().next())
    }

    /// Instances of the plan execution with a position whose `position_type`
    /// setup id is `position_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_position(
        &self,
        plan_execution_id: &str,
        position_type: PositionType,
        position_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT i.id FROM barrier_execution_instances i
             JOIN barrier_positions p ON p.instance_id = i.id
             WHERE i.plan_execution_id = ? AND p.{} = ?
             ORDER BY i.created_at, i.id",
            position_type.setup_column()
        );
        let ids = self
            .find_ids("find_by_position", &sql, &[plan_execution_id, position_setup_id])
            .await?;
        self.load_all(ids).await
    }

    /// Instances containing the barrier step `step_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_plan_node_id(
        &self,
        plan_execution_id: &str,
        step_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        self.find_by_position(plan_execution_id, PositionType::Step, step_setup_id)
            .await
    }

    /// Instances with a member in stage `stage_identifier`, restricted to
    /// `states` unless it is empty.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_stage_identifier(
        &self,
        plan_execution_id: &str,
        stage_identifier: &str,
        states: &[BarrierState],
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let ids = self
            .retry
            .run("find_by_stage_identifier", move || async move {
                let mut query = QueryBuilder::<Sqlite>::new(
                    "SELECT DISTINCT i.id FROM barrier_execution_instances i
                     JOIN barrier_stages s ON s.instance_id = i.id
                     WHERE i.plan_execution_id = ",
                );
                query.push_bind(plan_execution_id);
                query.push(" AND s.identifier = ");
                query.push_bind(stage_identifier);
                if !states.is_empty() {
                    query.push(" AND i.barrier_state IN (");
                    let mut list = query.separated(", ");
                    for state in states {
                        list.push_bind(state.as_str());
                    }
                    list.push_unseparated(")");
                }
                query.push(" ORDER BY i.created_at, i.id");
                let ids: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
                Ok(ids)
            })
            .await?;
        self.load_all(ids).await
    }

    /// Instances enclosing strategy node `strategy_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn find_by_strategy_setup_id(
        &self,
        plan_execution_id: &str,
        strategy_setup_id: &str,
    ) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let ids = self
            .find_ids(
                "find_by_strategy_setup_id",
                "SELECT DISTINCT i.id FROM barrier_execution_instances i
                 JOIN barrier_strategy_setup_ids s ON s.instance_id = i.id
                 WHERE i.plan_execution_id = ? AND s.strategy_setup_id = ?
                 ORDER BY i.created_at, i.id",
                &[plan_execution_id, strategy_setup_id],
            )
            .await?;
        self.load_all(ids).await
    }

    /// Whether any instance encloses strategy node `strategy_setup_id`.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    pub async fn exists_by_strategy_setup_id(
        &self,
        plan_execution_id: &str,
        strategy_setup_id: &str,
    ) -> Result<bool, StoreError> {
        self.retry
            .run("exists_by_strategy_setup_id", move || async move {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS (
                        SELECT 1 FROM barrier_execution_instances i
                        JOIN barrier_strategy_setup_ids s ON s.instance_id = i.id
                        WHERE i.plan_execution_id = ? AND s.strategy_setup_id = ?
                     )",
                )
                .bind(plan_execution_id)
                .bind(strategy_setup_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(exists)
            })
            .await
    }

    /// Replaces the positions of barrier `identifier` and records the
    /// concurrency width of `strategy_setup_id`.
    ///
    /// Used when a strategy expands into concrete replicas. Runs under the
    /// same named lock as [`Self::upsert`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the instance does not exist.
    #[instrument(skip(self, positions), fields(position_count = positions.len()))]
    pub async fn replace_positions(
        &self,
        identifier: &str,
        plan_execution_id: &str,
        positions: &[BarrierPosition],
        strategy_setup_id: &str,
        concurrency: u32,
    ) -> Result<BarrierExecutionInstance, StoreError> {
        let key = format!("{UPSERT_LOCK_PREFIX}{identifier}");
        let lock = self
            .locker
            .acquire(&key, self.upsert_lock.wait, self.upsert_lock.hold)
            .await?;

        let replaced = self
            .retry
            .run("replace_positions", move || async move {
                let mut tx = self.pool.begin().await?;
                let id: String = sqlx::query_scalar(
                    "SELECT id FROM barrier_execution_instances
                     WHERE identifier = ? AND plan_execution_id = ?",
                )
                .bind(identifier)
                .bind(plan_execution_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("{identifier}@{plan_execution_id}")))?;

                sqlx::query("DELETE FROM barrier_positions WHERE instance_id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                for (ordinal, position) in (0_i64..).zip(positions) {
                    insert_position(&mut tx, &id, ordinal, position).await?;
                }
                sqlx::query(
                    "INSERT INTO barrier_strategy_concurrency
                        (instance_id, strategy_setup_id, concurrency)
                     VALUES (?, ?, ?)
                     ON CONFLICT (instance_id, strategy_setup_id)
                     DO UPDATE SET concurrency = excluded.concurrency",
                )
                .bind(&id)
                .bind(strategy_setup_id)
                .bind(i64::from(concurrency))
                .execute(&mut *tx)
                .await?;
                sqlx::query("UPDATE barrier_execution_instances SET updated_at = ? WHERE id = ?")
                    .bind(Utc::now().timestamp_millis())
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;

                let instance = load_instance(&mut tx, &id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                tx.commit().await?;
                Ok(instance)
            })
            .await;

        if let Err(e) = self.locker.release(lock).await {
            warn!(lock_key = %key, error = %e, "Failed to release upsert lock");
        }
        replaced
    }

    /// Claims up to `batch` `Standing` instances that are due, pushing their
    /// next claim `lease` into the future.
    ///
    /// The claim is a single statement, so concurrent callers receive
    /// disjoint batches.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    #[instrument(skip(self))]
    pub async fn claim_standing(
        &self,
        batch: u32,
        lease: Duration,
    ) -> Result<Vec<BarrierId>, StoreError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        self.retry
            .run("claim_standing", move || async move {
                let now = Utc::now().timestamp_millis();
                let ids: Vec<String> = sqlx::query_scalar(
                    "UPDATE barrier_execution_instances SET next_iteration = ?1
                     WHERE id IN (
                        SELECT id FROM barrier_execution_instances
                        WHERE barrier_state = ?2 AND next_iteration <= ?3
                        ORDER BY next_iteration
                        LIMIT ?4
                     )
                     RETURNING id",
                )
                .bind(now.saturating_add(lease_ms))
                .bind(BarrierState::Standing.as_str())
                .bind(now)
                .bind(i64::from(batch))
                .fetch_all(&self.pool)
                .await?;
                Ok(ids.into_iter().map(BarrierId::from).collect())
            })
            .await
    }

    /// Deletes every instance owned by the given plan executions and returns
    /// how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a database error once retries are spent.
    #[instrument(skip_all, fields(plan_count = plan_execution_ids.len()))]
    pub async fn delete_all_for_plan_executions(
        &self,
        plan_execution_ids: &[String],
    ) -> Result<u64, StoreError> {
        if plan_execution_ids.is_empty() {
            return Ok(0);
        }

        let deleted = self
            .retry
            .run("delete_all_for_plan_executions", move || async move {
                let mut tx = self.pool.begin().await?;
                for table in [
                    "barrier_positions",
                    "barrier_stages",
                    "barrier_strategy_setup_ids",
                    "barrier_strategy_concurrency",
                ] {
                    let mut query = QueryBuilder::<Sqlite>::new(format!(
                        "DELETE FROM {table} WHERE instance_id IN \
                         (SELECT id FROM barrier_execution_instances WHERE plan_execution_id IN ("
                    ));
                    push_id_list(&mut query, plan_execution_ids);
                    query.push("))");
                    query.build().execute(&mut *tx).await?;
                }

                let mut query = QueryBuilder::<Sqlite>::new(
                    "DELETE FROM barrier_execution_instances WHERE plan_execution_id IN (",
                );
                push_id_list(&mut query, plan_execution_ids);
                query.push(")");
                let result = query.build().execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            })
            .await?;

        info!(deleted, "Barrier instances purged");
        Ok(deleted)
    }

    async fn find_ids(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<String>, StoreError> {
        self.retry
            .run(operation, move || async move {
                let mut query = sqlx::query_scalar::<Sqlite, String>(sql);
                for param in params {
                    query = query.bind(*param);
                }
                Ok(query.fetch_all(&self.pool).await?)
            })
            .await
    }

    async fn load_all(&self, ids: Vec<String>) -> Result<Vec<BarrierExecutionInstance>, StoreError> {
        let ids = &ids;
        self.retry
            .run("load_instances", move || async move {
                let mut conn = self.pool.acquire().await?;
                let mut instances = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(instance) = load_instance(&mut conn, id).await? {
                        instances.push(instance);
                    }
                }
                Ok(instances)
            })
            .await
    }
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    let mut list = query.separated(", ");
    for id in ids {
        list.push_bind(id.clone());
    }
}

async fn insert_setup(
    conn: &mut SqliteConnection,
    instance_id: &str,
    setup: &BarrierSetupInfo,
) -> Result<(), StoreError> {
    for stage in &setup.stages {
        sqlx::query(
            "INSERT OR IGNORE INTO barrier_stages (instance_id, identifier, name) VALUES (?, ?, ?)",
        )
        .bind(instance_id)
        .bind(&stage.identifier)
        .bind(stage.name.as_deref().unwrap_or_default())
        .execute(&mut *conn)
        .await?;
    }
    for strategy_id in &setup.strategy_setup_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO barrier_strategy_setup_ids (instance_id, strategy_setup_id)
             VALUES (?, ?)",
        )
        .bind(instance_id)
        .bind(strategy_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_position(
    conn: &mut SqliteConnection,
    instance_id: &str,
    ordinal: i64,
    position: &BarrierPosition,
) -> Result<i64, StoreError> {
    let result = sqlx::query(&format!(
        "INSERT INTO barrier_positions (instance_id, ordinal, {POSITION_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(instance_id)
    .bind(ordinal)
    .bind(&position.stage_setup_id)
    .bind(position.step_group_setup_id.as_deref())
    .bind(&position.step_setup_id)
    .bind(position.strategy_setup_id.as_deref())
    .bind(serde_json::to_string(&position.all_strategy_setup_ids)?)
    .bind(position.stage_runtime_id.as_deref())
    .bind(position.step_group_runtime_id.as_deref())
    .bind(position.step_runtime_id.as_deref())
    .bind(position.step_group_rollback)
    .bind(position.is_dummy_position)
    .bind(position.strategy_node_type.map(PositionType::as_str))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn fill_runtime_ids(
    conn: &mut SqliteConnection,
    row_id: i64,
    position: &BarrierPosition,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE barrier_positions SET
            stage_runtime_id = COALESCE(stage_runtime_id, ?),
            step_group_runtime_id = COALESCE(step_group_runtime_id, ?),
            step_runtime_id = COALESCE(step_runtime_id, ?)
         WHERE row_id = ?",
    )
    .bind(position.stage_runtime_id.as_deref())
    .bind(position.step_group_runtime_id.as_deref())
    .bind(position.step_runtime_id.as_deref())
    .bind(row_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_positions(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Vec<BarrierPosition>, StoreError> {
    Ok(load_position_rows(conn, instance_id)
        .await?
        .into_iter()
        .map(|(_, position)| position)
        .collect())
}

async fn load_position_rows(
    conn: &mut SqliteConnection,
    instance_id: &str,
) -> Result<Vec<(i64, BarrierPosition)>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT row_id, {POSITION_COLUMNS} FROM barrier_positions
         WHERE instance_id = ? ORDER BY ordinal, row_id"
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| -> Result<(i64, BarrierPosition), StoreError> {
            Ok((row.try_get("row_id")?, position_from_row(row)?))
        })
        .collect()
}

async fn load_instance(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<BarrierExecutionInstance>, StoreError> {
    let Some(row) = sqlx::query(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM barrier_execution_instances WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let stages = sqlx::query("SELECT identifier, name FROM barrier_stages WHERE instance_id = ?")
        .bind(id)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| -> Result<StageDetail, sqlx::Error> {
            let name: String = row.try_get("name")?;
            Ok(StageDetail {
                identifier: row.try_get("identifier")?,
                name: (!name.is_empty()).then_some(name),
            })
        })
        .collect::<Result<BTreeSet<_>, sqlx::Error>>()?;

    let strategy_setup_ids: BTreeSet<String> = sqlx::query_scalar(
        "SELECT strategy_setup_id FROM barrier_strategy_setup_ids WHERE instance_id = ?",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();

    let strategy_concurrency = sqlx::query_as::<_, (String, i64)>(
        "SELECT strategy_setup_id, concurrency FROM barrier_strategy_concurrency
         WHERE instance_id = ?",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|(strategy_id, concurrency)| {
        u32::try_from(concurrency)
            .map(|width| (strategy_id, width))
            .map_err(|_| StoreError::CorruptRow(format!("concurrency {concurrency} for {id}")))
    })
    .collect::<Result<BTreeMap<_, _>, _>>()?;

    let positions = load_positions(conn, id).await?;

    let state: String = row.try_get("barrier_state")?;
    Ok(Some(BarrierExecutionInstance {
        id: BarrierId::from(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        identifier: row.try_get("identifier")?,
        plan_execution_id: row.try_get("plan_execution_id")?,
        barrier_state: state
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("barrier state {state} for {id}")))?,
        setup_info: BarrierSetupInfo {
            name: row.try_get("setup_name")?,
            identifier: row.try_get("setup_identifier")?,
            stages,
            strategy_setup_ids,
        },
        position_info: BarrierPositionInfo {
            plan_execution_id: row.try_get("position_plan_execution_id")?,
            positions,
        },
        strategy_concurrency,
        created_at: timestamp(&row, "created_at")?,
        updated_at: timestamp(&row, "updated_at")?,
    }))
}

fn position_from_row(row: &SqliteRow) -> Result<BarrierPosition, StoreError> {
    let all_strategy_setup_ids: String = row.try_get("all_strategy_setup_ids")?;
    let strategy_node_type = row
        .try_get::<Option<String>, _>("strategy_node_type")?
        .map(|node_type| {
            node_type
                .parse::<PositionType>()
                .map_err(|e| StoreError::CorruptRow(e.to_string()))
        })
        .transpose()?;

    Ok(BarrierPosition {
        stage_setup_id: row.try_get("stage_setup_id")?,
        step_group_setup_id: row.try_get("step_group_setup_id")?,
        step_setup_id: row.try_get("step_setup_id")?,
        strategy_setup_id: row.try_get("strategy_setup_id")?,
        all_strategy_setup_ids: serde_json::from_str(&all_strategy_setup_ids)?,
        stage_runtime_id: row.try_get("stage_runtime_id")?,
        step_group_runtime_id: row.try_get("step_group_runtime_id")?,
        step_runtime_id: row.try_get("step_runtime_id")?,
        step_group_rollback: row.try_get("step_group_rollback")?,
        is_dummy_position: row.try_get("is_dummy_position")?,
        strategy_node_type,
    })
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let millis: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::CorruptRow(format!("{column} {millis}")))
}
