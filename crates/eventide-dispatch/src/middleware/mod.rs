//! Delivery middleware.
//!
//! Each delivery of one event to one subscription runs through an ordered
//! chain of [`Middleware`]. A middleware receives the delivery context and
//! a [`Next`] handle; calling [`Next::run`] invokes the rest of the chain and
//! finally the handler. `Next` is `Copy`, so a middleware may run it several
//! times (retry) or not at all (open circuit).

mod circuit_breaker;
mod metrics;
mod retry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use eventide_core::event::RecordedEvent;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState,
};
pub use metrics::{DeliveryMetrics, MetricsMiddleware, MetricsSnapshot};
pub use retry::RetryMiddleware;

use crate::backoff::RetryPolicy;
use crate::error::{DeliveryError, HandlerError};
use crate::handler::EventHandler;

/// Everything a middleware may inspect about one delivery.
#[derive(Debug)]
pub struct DeliveryContext<'a> {
    /// The event being delivered.
    pub event: &'a RecordedEvent,
    /// Target subscription.
    pub subscription_id: Uuid,
    /// Handler name, for logs and metrics.
    pub handler_name: &'a str,
    /// The subscription's retry policy.
    pub retry: RetryPolicy,
    /// Stops retries and backoff sleeps when triggered.
    pub cancel: &'a CancellationToken,
    attempts: AtomicU32,
}

impl<'a> DeliveryContext<'a> {
    /// Creates a context for one delivery.
    #[must_use]
    pub fn new(
        event: &'a RecordedEvent,
        subscription_id: Uuid,
        handler_name: &'a str,
        retry: RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            event,
            subscription_id,
            handler_name,
            retry,
            cancel,
            attempts: AtomicU32::new(0),
        }
    }

    /// How many times the handler itself has been invoked so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

/// One link of the delivery chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Wraps the remainder of the chain.
    async fn handle(&self, ctx: &DeliveryContext<'_>, next: Next<'_>) -> Result<(), DeliveryError>;

    /// Drops any per-subscription state kept for `subscription_id`.
    fn subscription_removed(&self, _subscription_id: Uuid) {}
}

/// The remainder of a middleware chain, ending at the handler.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn EventHandler,
}

impl<'a> Next<'a> {
    /// Starts a chain over `chain` that ends at `handler`.
    #[must_use]
    pub fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn EventHandler) -> Self {
        Self { chain, handler }
    }

    /// Runs the rest of the chain.
    ///
    /// # Errors
    ///
    /// Returns whatever the remaining middleware or the handler returns.
    pub async fn run(self, ctx: &DeliveryContext<'_>) -> Result<(), DeliveryError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        chain: rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => {
                ctx.attempts.fetch_add(1, Ordering::AcqRel);
                AssertUnwindSafe(self.handler.handle(ctx.event))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(
                            subscription_id = %ctx.subscription_id,
                            handler = ctx.handler_name,
                            event_id = %ctx.event.event_id,
                            panic = %message,
                            "event handler panicked"
                        );
                        Err(HandlerError::Failed(format!("handler panicked: {message}")))
                    })
                    .map_err(DeliveryError::from)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("chain", &self.chain.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// The default chain: retry outermost, then the circuit breaker, then
/// metrics around each handler invocation.
#[must_use]
pub fn default_chain(
    circuit: CircuitBreakerConfig,
    metrics: Arc<DeliveryMetrics>,
) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(RetryMiddleware),
        Arc::new(CircuitBreakerMiddleware::new(circuit)),
        Arc::new(MetricsMiddleware::new(metrics)),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use eventide_core::event::{NewEvent, RecordedEvent};
    use parking_lot::Mutex;

    use crate::error::HandlerError;
    use crate::handler::EventHandler;

    pub(crate) fn event(event_type: &str) -> RecordedEvent {
        NewEvent::new("Counter", event_type, serde_json::json!({ "by": 1 }), Utc::now())
            .record("c-1", 1)
    }

    /// Records every event it sees and succeeds.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingHandler {
        name: String,
        seen: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingHandler {
        pub(crate) fn named(name: &str) -> Self {
            Self {
                name: name.to_owned(),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn seen(&self) -> Vec<RecordedEvent> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: &RecordedEvent) -> Result<(), HandlerError> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    /// Panics on every call.
    #[derive(Debug, Default)]
    pub(crate) struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(&self, event: &RecordedEvent) -> Result<(), HandlerError> {
            panic!("projection state poisoned by {}", event.event_type)
        }
    }

    /// Fails its first `failures` calls with `error`, then succeeds.
    #[derive(Debug)]
    pub(crate) struct FailingHandler {
        failures: u32,
        error: HandlerError,
        calls: AtomicU32,
    }

    impl FailingHandler {
        pub(crate) fn always(error: HandlerError) -> Self {
            Self::times(u32::MAX, error)
        }

        pub(crate) fn times(failures: u32, error: HandlerError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: &RecordedEvent) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }
}
