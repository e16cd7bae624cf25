//! Lease-based named mutex.
//!
//! A lock is a row in `named_locks` owned by a random token until its lease
//! expires. Expired leases can be taken over, so a crashed holder blocks
//! others for at most the hold time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::StoreError;

/// Default time to wait for a contended lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);
/// Default lease length.
pub const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(30);
/// Default delay between acquisition attempts.
pub const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(25);

/// Wait and lease durations for one class of lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeouts {
    /// How long `acquire` keeps trying.
    pub wait: Duration,
    /// Lease length once acquired.
    pub hold: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            wait: DEFAULT_LOCK_WAIT,
            hold: DEFAULT_LOCK_HOLD,
        }
    }
}

/// A held lease.
///
/// Hand it back through [`NamedLocker::release`]. Dropping it without
/// releasing leaves the lease to expire.
#[derive(Debug)]
pub struct AcquiredLock {
    key: String,
    owner: String,
    expires_at: DateTime<Utc>,
}

impl AcquiredLock {
    /// Lock name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written to the lock row.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease expiry.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Provider of named mutual exclusion.
#[async_trait]
pub trait NamedLocker: Send + Sync {
    /// Acquires `key`, waiting up to `wait`, leasing it for `hold`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockUnavailable`] when `wait` runs out.
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        hold: Duration,
    ) -> Result<AcquiredLock, StoreError>;

    /// Releases a lease. Releasing a lease that was taken over is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock row cannot be deleted.
    async fn release(&self, lock: AcquiredLock) -> Result<(), StoreError>;
}

/// [`NamedLocker`] backed by the `named_locks` table.
#[derive(Clone)]
pub struct SqlLocker {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqlLocker {
    /// Creates a locker on `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_LOCK_POLL,
        }
    }

    /// Sets the delay between acquisition attempts.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        hold: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = Utc::now();
        let hold_ms = i64::try_from(hold.as_millis()).unwrap_or(i64::MAX);
        let expires_at = DateTime::from_timestamp_millis(now.timestamp_millis().saturating_add(hold_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let result = sqlx::query(
            "INSERT INTO named_locks (name, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE
                SET owner = excluded.owner, expires_at = excluded.expires_at
                WHERE named_locks.expires_at <= ?4",
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(expires_at))
    }
}

#[async_trait]
impl NamedLocker for SqlLocker {
    #[instrument(skip(self), fields(lock_key = %key))]
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        hold: Duration,
    ) -> Result<AcquiredLock, StoreError> {
        let started = Instant::now();
        let owner = uuid::Uuid::new_v4().to_string();

        loop {
            if let Some(expires_at) = self.try_acquire(key, &owner, hold).await? {
                debug!(owner = %owner, "Lock acquired");
                return Ok(AcquiredLock {
                    key: key.to_string(),
                    owner,
                    expires_at,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Err(StoreError::LockUnavailable {
                    key: key.to_string(),
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(self.poll_interval.min(wait - elapsed)).await;
        }
    }

    #[instrument(skip(self, lock), fields(lock_key = %lock.key))]
    async fn release(&self, lock: AcquiredLock) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM named_locks WHERE name = ? AND owner = ?")
            .bind(&lock.key)
            .bind(&lock.owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            debug!("Lease already taken over or expired");
        }
        Ok(())
    }
}
