//! Barrier-level errors.

use crate::store::StoreError;

/// Errors surfaced by barrier registration and evaluation.
///
/// Abandoned and timed-out barriers are outcomes, not errors; they are
/// reported through the release notifier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// Store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// The workflow definition cannot produce valid positions.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    /// A position type outside stage, step group and step.
    #[error("{0} position type is not implemented")]
    UnknownPositionType(String),
    /// A barrier state outside the four known states.
    #[error("Unknown barrier state: {0}")]
    UnknownState(String),
    /// Barrier instance not found.
    #[error("Barrier not found for id: {0}")]
    NotFound(String),
}

impl BarrierError {
    /// Whether the caller may retry the same call unchanged.
    ///
    /// Covers transient database failures and named-lock contention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient() || matches!(err, StoreError::LockUnavailable { .. }),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_is_retryable() {
        let err = BarrierError::from(StoreError::LockUnavailable {
            key: "BARRIER_UPSERT_LOCK_b1".into(),
            waited_ms: 10,
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        assert!(!BarrierError::UnknownPositionType("PLAN".into()).is_retryable());
        assert!(!BarrierError::InvalidDefinition("empty".into()).is_retryable());
    }
}
