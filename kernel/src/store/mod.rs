//! Persistence for barrier instances and their adapters.

/// Barrier instance store with `SQLite` backend.
pub mod r#impl;
/// Lease-based named locks.
pub mod lock;
/// Durable release outbox.
pub mod outbox;
/// Bounded retry for transient failures.
pub mod retry;
/// Table definitions.
pub mod schema;
/// Execution-status table adapter.
pub mod status;

pub use lock::{AcquiredLock, LockTimeouts, NamedLocker, SqlLocker};
pub use outbox::{OutboxEntry, OutboxNotifier};
pub use r#impl::{BarrierStore, StoreError, UPSERT_LOCK_PREFIX};
pub use retry::RetryPolicy;
pub use schema::migrate;
pub use status::SqlStatusSource;
