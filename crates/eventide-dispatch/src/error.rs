//! Delivery and dead-letter error types.

use thiserror::Error;
use uuid::Uuid;

use crate::dispatcher::SubscriptionState;

/// Errors a handler reports for one event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; retried per policy.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The event could not be decoded into the handler's input type.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The event decoded but was rejected by validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl HandlerError {
    /// Returns `true` for failures that retrying cannot fix.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Deserialization(_) | Self::Validation(_))
    }

    /// Short tag used in metrics and dead-letter records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "HandlerError",
            Self::Deserialization(_) => "DeserializationError",
            Self::Validation(_) => "ValidationError",
        }
    }
}

/// Errors surfaced by delivering one event to one subscription.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The handler failed, after any retries.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The subscription's circuit is open; the handler was not invoked.
    #[error("circuit open for subscription {0}")]
    CircuitOpen(Uuid),

    /// Delivery was cancelled before it completed.
    #[error("delivery cancelled")]
    Cancelled,

    /// No subscription is registered under the id.
    #[error("no such subscription: {0}")]
    NoSuchSubscription(Uuid),

    /// The subscription exists but does not accept events.
    #[error("subscription {id} is {state:?}")]
    SubscriptionInactive {
        /// The subscription.
        id: Uuid,
        /// Its current state.
        state: SubscriptionState,
    },
}

impl DeliveryError {
    /// Short tag used in metrics and dead-letter records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(e) => e.kind(),
            Self::CircuitOpen(_) => "CircuitOpen",
            Self::Cancelled => "Cancelled",
            Self::NoSuchSubscription(_) => "NoSuchSubscription",
            Self::SubscriptionInactive { .. } => "SubscriptionInactive",
        }
    }
}

/// Errors raised by the dead-letter queue.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// A replay is already running.
    #[error("dead-letter replay already in progress")]
    ReplayInProgress,

    /// No entry matches the id or prefix.
    #[error("no dead letter matches {0}")]
    NotFound(String),

    /// More than one entry matches the prefix.
    #[error("dead-letter id prefix {prefix} is ambiguous ({matches} matches)")]
    AmbiguousPrefix {
        /// The prefix given.
        prefix: String,
        /// How many entries it matched.
        matches: usize,
    },

    /// The backing store failed.
    #[error("dead-letter storage failed: {0}")]
    Storage(String),
}
