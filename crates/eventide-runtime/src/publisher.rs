//! Hand-off of committed events.

use async_trait::async_trait;
use eventide_core::event::RecordedEvent;
use eventide_dispatch::Dispatcher;

/// Receives events after they are durably committed. Forwarding is
/// fire-and-forget: delivery failures are the receiver's concern and never
/// undo a commit.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Forwards committed events, in commit order.
    async fn forward(&self, events: &[RecordedEvent]);
}

#[async_trait]
impl EventPublisher for Dispatcher {
    async fn forward(&self, events: &[RecordedEvent]) {
        let report = self.publish_all(events).await;
        if !report.is_clean() {
            tracing::warn!(
                events = events.len(),
                delivered = report.delivered,
                failures = report.failures.len(),
                "committed events had failed deliveries"
            );
        }
    }
}
