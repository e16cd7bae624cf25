//! Process wiring for the barrier kernel.
//!
//! [`BarrierKernel`] owns the database pool and the assembled service stack:
//! a lock-guarded store, a status proctor over the `execution_status` table
//! and a release outbox. It is cheap to clone.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::barrier::{BarrierService, BarrierStateMachine, ExecutionStatusProctor};
use crate::infrastructure::config::Settings;
use crate::poller::{BarrierPoller, PollerConfig};
use crate::store::{migrate, BarrierStore, OutboxNotifier, SqlLocker, SqlStatusSource};

/// Assembled barrier kernel.
#[derive(Clone)]
pub struct BarrierKernel {
    pool: SqlitePool,
    service: BarrierService,
    status: SqlStatusSource,
    outbox: OutboxNotifier,
    poller: Option<PollerConfig>,
}

impl std::fmt::Debug for BarrierKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierKernel")
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl BarrierKernel {
    /// Connects to the configured database, creates the schema and wires
    /// the service stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn new(settings: &Settings) -> Result<Self> {
        let pool = settings
            .database
            .connect()
            .await
            .context("Failed to open barrier database")?;
        Self::with_pool(pool, settings).await
    }

    /// Wires the service stack over an existing pool, creating the schema
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn with_pool(pool: SqlitePool, settings: &Settings) -> Result<Self> {
        migrate(&pool)
            .await
            .context("Failed to create barrier schema")?;

        let locker = SqlLocker::new(pool.clone()).with_poll_interval(settings.locking.poll_interval());
        let retry = settings.retry.to_policy();
        let store = BarrierStore::new(pool.clone())
            .with_locker(Arc::new(locker))
            .with_retry(retry)
            .with_upsert_lock(settings.locking.upsert_timeouts());

        let status = SqlStatusSource::new(pool.clone());
        let outbox = OutboxNotifier::new(pool.clone()).with_retry(retry);
        let proctor = ExecutionStatusProctor::new(Arc::new(status.clone()));
        let machine = BarrierStateMachine::new(store, Arc::new(proctor), Arc::new(outbox.clone()))
            .with_notify_retry(retry);

        let poller = settings
            .poller
            .enabled
            .then(|| settings.poller.to_config());

        Ok(Self {
            pool,
            service: BarrierService::new(machine),
            status,
            outbox,
            poller,
        })
    }

    /// Database pool shared by every component.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Barrier service facade.
    #[must_use]
    pub fn service(&self) -> &BarrierService {
        &self.service
    }

    /// Execution-status table the proctor reads.
    #[must_use]
    pub fn status(&self) -> &SqlStatusSource {
        &self.status
    }

    /// Release outbox the state machine writes.
    #[must_use]
    pub fn outbox(&self) -> &OutboxNotifier {
        &self.outbox
    }

    /// Starts the background poller, or returns `None` when it is disabled.
    /// The task stops once `token` is cancelled.
    #[must_use]
    pub fn spawn_poller(&self, token: &CancellationToken) -> Option<JoinHandle<()>> {
        let config = self.poller.clone()?;
        info!(worker_id = %config.worker_id, "Starting barrier poller");
        let poller = BarrierPoller::new(self.service.machine().clone(), config);
        Some(tokio::spawn(poller.run(token.clone().cancelled_owned())))
    }
}
