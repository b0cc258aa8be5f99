//! Best-effort change notifications.
//!
//! Stores publish every successfully appended event to a [`NotificationHub`].
//! Subscribers receive them through a bounded broadcast channel; a slow
//! subscriber that falls behind skips what it missed. Durability belongs to
//! the store, so a subscriber that needs every event reads the store.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::RecordedEvent;

/// Default broadcast buffer size.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Every event.
    All,
    /// Events with this discriminator.
    EventType(String),
    /// Events produced by this aggregate type.
    AggregateType(String),
}

impl Channel {
    /// Returns `true` if `event` belongs to this channel.
    #[must_use]
    pub fn matches(&self, event: &RecordedEvent) -> bool {
        match self {
            Self::All => true,
            Self::EventType(t) => event.event_type == *t,
            Self::AggregateType(t) => event.aggregate_type == *t,
        }
    }
}

/// Fan-out point for appended events.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Arc<RecordedEvent>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl NotificationHub {
    /// Creates a hub buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes appended events. Having no subscribers is not an error.
    pub fn publish(&self, events: &[RecordedEvent]) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        for event in events {
            let _ = self.sender.send(Arc::new(event.clone()));
        }
    }

    /// Opens a subscription on `channel`.
    #[must_use]
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        Subscription {
            channel,
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of a channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: Channel,
    receiver: broadcast::Receiver<Arc<RecordedEvent>>,
}

impl Subscription {
    /// The channel this subscription filters on.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Waits for the next matching event. Returns `None` once the hub is
    /// dropped.
    pub async fn recv(&mut self) -> Option<Arc<RecordedEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.channel.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, channel = ?self.channel, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
