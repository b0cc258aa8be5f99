//! Unit-of-work error types.

use eventide_core::error::{AggregateError, DomainError, EventStoreError};
use thiserror::Error;

use crate::unit_of_work::UnitState;

/// A stream whose persisted version moved while a unit of work held it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConflict {
    /// The stream.
    pub stream_id: String,
    /// Version recorded when the aggregate was tracked.
    pub expected: u64,
    /// Version found at commit.
    pub actual: u64,
}

impl std::fmt::Display for StreamConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (expected {}, found {})", self.stream_id, self.expected, self.actual)
    }
}

/// Errors raised by a unit of work.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// One or more tracked streams changed since they were tracked. The
    /// unit was rolled back; reload the aggregates and retry.
    #[error("concurrency conflict on {} stream(s): {}", .conflicts.len(), join(.conflicts))]
    Concurrency {
        /// Every conflicting stream.
        conflicts: Vec<StreamConflict>,
    },

    /// The operation is not allowed in the unit's current state.
    #[error("cannot {operation} a unit of work that is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The unit's state.
        state: UnitState,
    },

    /// The event store failed. The unit was rolled back.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Pending events could not be encoded.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl UnitOfWorkError {
    /// Returns `true` if reloading and retrying may succeed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

fn join(conflicts: &[StreamConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<UnitOfWorkError> for DomainError {
    fn from(err: UnitOfWorkError) -> Self {
        match err {
            UnitOfWorkError::Concurrency { mut conflicts } if !conflicts.is_empty() => {
                let first = conflicts.swap_remove(0);
                Self::ConcurrencyConflict {
                    aggregate_id: first.stream_id,
                    expected: first.expected,
                    actual: first.actual,
                }
            }
            UnitOfWorkError::Store(e) => e.into(),
            UnitOfWorkError::Aggregate(e) => Self::Aggregate(e),
            other => Self::Infrastructure(other.to_string()),
        }
    }
}
