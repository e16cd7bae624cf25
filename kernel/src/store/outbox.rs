//! Durable release outbox.
//!
//! Releases are appended to `barrier_releases` and drained by the wait/notify
//! engine in sequence order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::{RetryPolicy, StoreError};
use crate::barrier::notifier::{ReleaseNotifier, ReleaseOutcome};
use crate::barrier::types::BarrierId;

/// A release waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Monotonic sequence number.
    pub seq: i64,
    /// Released barrier.
    pub barrier_id: BarrierId,
    /// Outcome to deliver.
    pub outcome: ReleaseOutcome,
    /// Time the release was recorded.
    pub created_at: DateTime<Utc>,
}

/// [`ReleaseNotifier`] that persists releases for asynchronous delivery.
#[derive(Clone)]
pub struct OutboxNotifier {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl OutboxNotifier {
    /// Creates an outbox on `pool` with the default retry policy.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy for outbox writes.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Entries after `after_seq`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row is malformed.
    pub async fn fetch_after(
        &self,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, barrier_id, failed, timed_out, message, created_at
             FROM barrier_releases WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(after_seq)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<OutboxEntry, StoreError> {
                let created_at: i64 = row.try_get("created_at")?;
                Ok(OutboxEntry {
                    seq: row.try_get("seq")?,
                    barrier_id: BarrierId::from(row.try_get::<String, _>("barrier_id")?),
                    outcome: ReleaseOutcome {
                        failed: row.try_get("failed")?,
                        timed_out: row.try_get("timed_out")?,
                        message: row.try_get("message")?,
                    },
                    created_at: DateTime::from_timestamp_millis(created_at).ok_or_else(|| {
                        StoreError::CorruptRow(format!("release created_at {created_at}"))
                    })?,
                })
            })
            .collect()
    }

    /// Drops delivered entries up to and including `seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    #[instrument(skip(self))]
    pub async fn acknowledge_through(&self, seq: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM barrier_releases WHERE seq <= ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReleaseNotifier for OutboxNotifier {
    async fn notify(&self, barrier_id: &BarrierId, outcome: ReleaseOutcome) -> anyhow::Result<()> {
        let outcome = &outcome;
        let seq = self
            .retry
            .run("queue_release", move || async move {
                let result = sqlx::query(
                    "INSERT INTO barrier_releases
                        (barrier_id, failed, timed_out, message, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(barrier_id.as_str())
                .bind(outcome.failed)
                .bind(outcome.timed_out)
                .bind(outcome.message.as_deref())
                .bind(Utc::now().timestamp_millis())
                .execute(&self.pool)
                .await?;
                Ok(result.last_insert_rowid())
            })
            .await?;
        debug!(barrier_id = %barrier_id, seq, "Release queued");
        Ok(())
    }
}
