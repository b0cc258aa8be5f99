//! Eventide Dispatch — delivery of persisted events to handlers.
//!
//! Handlers subscribe through the [`dispatcher::Dispatcher`]. Every delivery
//! runs through a middleware chain (retry, circuit breaker, metrics), and
//! deliveries that fail for good land in the [`dead_letter`] queue, from
//! which they can be inspected and replayed.

pub mod backoff;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod middleware;

pub use backoff::{Backoff, BackoffKind, RetryPolicy};
pub use dead_letter::{
    DeadLetterAdmin, DeadLetterEvent, DeadLetterQueue, DeadLetterReason, DeadLetterReplayer,
    DeadLetterStore, FileDeadLetterStore, InMemoryDeadLetterStore, ReplayOptions, ReplayReport,
};
pub use dispatcher::{DispatchReport, Dispatcher, SubscriptionOptions, SubscriptionState};
pub use error::{DeadLetterError, DeliveryError, HandlerError};
pub use handler::{EventHandler, EventMatcher, FnHandler};
