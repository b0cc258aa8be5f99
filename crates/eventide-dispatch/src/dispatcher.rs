//! Event dispatcher and subscription registry.
//!
//! The registry lock guards structural changes only (subscribe, state
//! changes, unsubscribe). `publish` copies the matching registrations out
//! and runs the deliveries concurrently without holding it.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use eventide_core::event::RecordedEvent;
use eventide_core::notify::Subscription;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::dead_letter::{DeadLetterFailure, DeadLetterQueue, DeadLetterReplayer};
use crate::error::DeliveryError;
use crate::handler::{EventHandler, EventMatcher};
use crate::middleware::{
    CircuitBreakerConfig, DeliveryContext, DeliveryMetrics, Middleware, Next, default_chain,
};

/// Lifecycle of a subscription. Only `Active` subscriptions receive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Receiving events.
    Active,
    /// Temporarily not receiving events.
    Paused,
    /// Stopped after a failure; can be resumed.
    Failed,
    /// Finished for good.
    Completed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::Paused => "Paused",
            Self::Failed => "Failed",
            Self::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// How to register a handler.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Fixed subscription id; a random one when `None`. A stable id lets
    /// dead letters recorded by an earlier process find the subscription
    /// again.
    pub id: Option<Uuid>,
    /// Event types to receive.
    pub matcher: EventMatcher,
    /// Retry policy; the dispatcher default when `None`.
    pub retry: Option<RetryPolicy>,
    /// Move the subscription to `Failed` when one of its deliveries is
    /// dead-lettered.
    pub fail_on_dead_letter: bool,
}

impl SubscriptionOptions {
    /// Options receiving `matcher` with default policies.
    #[must_use]
    pub fn new(matcher: EventMatcher) -> Self {
        Self {
            id: None,
            matcher,
            retry: None,
            fail_on_dead_letter: false,
        }
    }

    /// Registers under `id` instead of a random id.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Uses `retry` instead of the dispatcher default.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Fails the subscription on its first dead letter.
    #[must_use]
    pub fn fail_on_dead_letter(mut self) -> Self {
        self.fail_on_dead_letter = true;
        self
    }
}

struct Registration {
    id: Uuid,
    matcher: EventMatcher,
    handler: Arc<dyn EventHandler>,
    retry: RetryPolicy,
    fail_on_dead_letter: bool,
    order: u64,
    state: Mutex<SubscriptionState>,
}

impl Registration {
    fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            matcher: self.matcher.clone(),
            handler_name: self.handler.name().to_owned(),
            retry: self.retry,
            state: self.state(),
        }
    }
}

/// Read-only view of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: Uuid,
    /// Event types received.
    pub matcher: EventMatcher,
    /// Handler name.
    pub handler_name: String,
    /// Effective retry policy.
    pub retry: RetryPolicy,
    /// Current state.
    pub state: SubscriptionState,
}

/// A delivery that failed for good.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    /// Subscription the delivery was for.
    pub subscription_id: Uuid,
    /// Handler name.
    pub handler_name: String,
    /// Final error.
    pub error: DeliveryError,
    /// Handler invocations made.
    pub attempts: u32,
    /// Dead-letter entry, if one was recorded.
    pub dead_letter_id: Option<Uuid>,
}

/// Outcome of publishing one or more events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Successful deliveries.
    pub delivered: usize,
    /// Failed deliveries, isolated from each other.
    pub failures: Vec<DeliveryFailure>,
}

impl DispatchReport {
    /// Returns `true` if every delivery succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    retry: RetryPolicy,
    circuit: CircuitBreakerConfig,
    metrics: Option<Arc<DeliveryMetrics>>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl DispatcherBuilder {
    /// Default retry policy for subscriptions that do not set one.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Circuit breaker settings, applied per subscription.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Shares a metrics registry.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Routes final failures to `queue`.
    #[must_use]
    pub fn dead_letters(mut self, queue: Arc<DeadLetterQueue>) -> Self {
        self.dead_letters = Some(queue);
        self
    }

    /// Appends a middleware after the default chain, closest to the
    /// handler.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Builds the dispatcher.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        let metrics = self.metrics.unwrap_or_default();
        let mut chain = default_chain(self.circuit, Arc::clone(&metrics));
        chain.extend(self.middleware);
        Dispatcher {
            registry: Mutex::new(Vec::new()),
            next_order: AtomicU64::new(0),
            chain,
            default_retry: self.retry,
            metrics,
            dead_letters: self.dead_letters,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Delivers persisted events to subscribed handlers.
pub struct Dispatcher {
    registry: Mutex<Vec<Arc<Registration>>>,
    next_order: AtomicU64,
    chain: Vec<Arc<dyn Middleware>>,
    default_retry: RetryPolicy,
    metrics: Arc<DeliveryMetrics>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriptions", &self.registry.lock().len())
            .field("chain", &self.chain.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("default_retry", &self.default_retry)
            .field("dead_letters", &self.dead_letters.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Dispatcher {
    /// Starts a builder with default policies.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Shared metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    /// Dead-letter queue, if configured.
    #[must_use]
    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letters.as_ref()
    }

    /// Registers `handler` for `matcher` with default policies.
    pub fn subscribe(&self, matcher: EventMatcher, handler: Arc<dyn EventHandler>) -> Uuid {
        self.subscribe_with(SubscriptionOptions::new(matcher), handler)
    }

    /// Registers `handler` with explicit options. A registration already
    /// holding the requested id is replaced.
    pub fn subscribe_with(&self, options: SubscriptionOptions, handler: Arc<dyn EventHandler>) -> Uuid {
        let registration = Registration {
            id: options.id.unwrap_or_else(Uuid::new_v4),
            matcher: options.matcher,
            handler,
            retry: options.retry.unwrap_or(self.default_retry),
            fail_on_dead_letter: options.fail_on_dead_letter,
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SubscriptionState::Active),
        };
        let id = registration.id;
        tracing::info!(
            subscription_id = %id,
            handler = registration.handler.name(),
            matcher = ?registration.matcher,
            "subscription registered"
        );
        let replaced = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.retain(|r| r.id != id);
            let replaced = registry.len() != before;
            registry.push(Arc::new(registration));
            replaced
        };
        if replaced {
            tracing::info!(subscription_id = %id, "replaced existing subscription");
            self.forget(id);
        }
        id
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.retain(|r| r.id != id);
            registry.len() != before
        };
        if removed {
            self.forget(id);
            tracing::info!(subscription_id = %id, "subscription removed");
        }
        removed
    }

    fn forget(&self, id: Uuid) {
        for middleware in &self.chain {
            middleware.subscription_removed(id);
        }
    }

    /// Current state of a subscription.
    #[must_use]
    pub fn state(&self, id: Uuid) -> Option<SubscriptionState> {
        self.registration(id).map(|r| r.state())
    }

    /// Every registration, in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.lock().iter().map(|r| r.info()).collect()
    }

    /// Stops delivery to a subscription until resumed.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchSubscription`, or `SubscriptionInactive` if the
    /// subscription is failed or completed.
    pub fn pause(&self, id: Uuid) -> Result<(), DeliveryError> {
        self.transition(id, SubscriptionState::Paused, |from| {
            matches!(from, SubscriptionState::Active | SubscriptionState::Paused)
        })
    }

    /// Resumes a paused or failed subscription.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchSubscription`, or `SubscriptionInactive` if the
    /// subscription is completed.
    pub fn resume(&self, id: Uuid) -> Result<(), DeliveryError> {
        self.transition(id, SubscriptionState::Active, |from| from != SubscriptionState::Completed)
    }

    /// Marks a subscription finished. Completed subscriptions never
    /// resume.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchSubscription`.
    pub fn complete(&self, id: Uuid) -> Result<(), DeliveryError> {
        self.transition(id, SubscriptionState::Completed, |_| true)
    }

    /// Marks a subscription failed.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchSubscription`, or `SubscriptionInactive` if the
    /// subscription is completed.
    pub fn fail(&self, id: Uuid) -> Result<(), DeliveryError> {
        self.transition(id, SubscriptionState::Failed, |from| from != SubscriptionState::Completed)
    }

    /// Cancels in-flight retries and backoff sleeps. Cancelled deliveries
    /// are reported but not dead-lettered.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Delivers `event` to every active matching subscription, most
    /// specific matcher first, concurrently. One handler's failure never
    /// affects the others.
    pub async fn publish(&self, event: &RecordedEvent) -> DispatchReport {
        let targets = self.matching(&event.event_type);
        if targets.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no subscriptions for event");
            return DispatchReport::default();
        }

        let outcomes = join_all(targets.iter().map(|r| self.deliver(r, event))).await;
        let mut report = DispatchReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(failure) => report.failures.push(failure),
            }
        }
        report
    }

    /// Publishes `events` one after another, preserving their order.
    pub async fn publish_all(&self, events: &[RecordedEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for event in events {
            report.merge(self.publish(event).await);
        }
        report
    }

    /// Publishes every notification from `subscription` until `stop` is
    /// triggered or the hub closes. Returns how many events were
    /// published.
    pub async fn listen(&self, mut subscription: Subscription, stop: CancellationToken) -> u64 {
        let mut published = 0;
        loop {
            let event = tokio::select! {
                () = stop.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            let report = self.publish(&event).await;
            if !report.is_clean() {
                tracing::warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    failures = report.failures.len(),
                    "notified event had failed deliveries"
                );
            }
            published += 1;
        }
        tracing::debug!(published, "dispatcher listener stopped");
        published
    }

    fn registration(&self, id: Uuid) -> Option<Arc<Registration>> {
        self.registry.lock().iter().find(|r| r.id == id).cloned()
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<Registration>> {
        let mut targets: Vec<Arc<Registration>> = self
            .registry
            .lock()
            .iter()
            .filter(|r| r.state() == SubscriptionState::Active && r.matcher.matches(event_type))
            .cloned()
            .collect();
        targets.sort_by_key(|r| (Reverse(r.matcher.specificity()), r.order));
        targets
    }

    fn transition(
        &self,
        id: Uuid,
        to: SubscriptionState,
        allowed: impl FnOnce(SubscriptionState) -> bool,
    ) -> Result<(), DeliveryError> {
        let registration = self
            .registration(id)
            .ok_or(DeliveryError::NoSuchSubscription(id))?;
        let mut state = registration.state.lock();
        if !allowed(*state) {
            return Err(DeliveryError::SubscriptionInactive { id, state: *state });
        }
        if *state != to {
            tracing::info!(subscription_id = %id, from = %*state, to = %to, "subscription state changed");
            *state = to;
        }
        Ok(())
    }

    async fn run_chain(&self, registration: &Registration, event: &RecordedEvent) -> (Result<(), DeliveryError>, u32) {
        let ctx = DeliveryContext::new(
            event,
            registration.id,
            registration.handler.name(),
            registration.retry,
            &self.shutdown,
        );
        let result = Next::new(&self.chain, registration.handler.as_ref()).run(&ctx).await;
        (result, ctx.attempts())
    }

    async fn deliver(&self, registration: &Registration, event: &RecordedEvent) -> Result<(), DeliveryFailure> {
        let (result, attempts) = self.run_chain(registration, event).await;
        let Err(error) = result else {
            return Ok(());
        };

        let mut failure = DeliveryFailure {
            subscription_id: registration.id,
            handler_name: registration.handler.name().to_owned(),
            error,
            attempts,
            dead_letter_id: None,
        };
        if failure.error == DeliveryError::Cancelled {
            return Err(failure);
        }

        match &self.dead_letters {
            Some(queue) => {
                let details = DeadLetterFailure::from_delivery(&failure.error, registration.id, attempts);
                match queue.add(event, &event.event_type, details).await {
                    Ok(entry) => failure.dead_letter_id = Some(entry.id),
                    Err(e) => tracing::error!(
                        subscription_id = %registration.id,
                        event_id = %event.event_id,
                        error = %e,
                        "failed to record dead letter"
                    ),
                }
            }
            None => tracing::error!(
                subscription_id = %registration.id,
                event_id = %event.event_id,
                error = %failure.error,
                "delivery failed and no dead-letter queue is configured"
            ),
        }

        if registration.fail_on_dead_letter && failure.dead_letter_id.is_some() {
            let mut state = registration.state.lock();
            if *state == SubscriptionState::Active {
                *state = SubscriptionState::Failed;
                tracing::warn!(subscription_id = %registration.id, "subscription failed after dead letter");
            }
        }
        Err(failure)
    }
}

/// Replays to the recorded subscription when it is still registered. An
/// id this dispatcher does not know, typically one recorded before a
/// restart, falls back to every active subscription matching the event
/// type.
#[async_trait]
impl DeadLetterReplayer for Dispatcher {
    async fn replay(&self, subscription_id: Option<Uuid>, event: &RecordedEvent) -> Result<(), DeliveryError> {
        let targets = match subscription_id.map(|id| (id, self.registration(id))) {
            Some((id, Some(registration))) => {
                let state = registration.state();
                if state != SubscriptionState::Active {
                    return Err(DeliveryError::SubscriptionInactive { id, state });
                }
                vec![registration]
            }
            Some((id, None)) => {
                let targets = self.matching(&event.event_type);
                if targets.is_empty() {
                    return Err(DeliveryError::NoSuchSubscription(id));
                }
                tracing::info!(
                    subscription_id = %id,
                    event_type = %event.event_type,
                    targets = targets.len(),
                    "recorded subscription not registered, replaying to matching subscriptions"
                );
                targets
            }
            None => self.matching(&event.event_type),
        };
        let results = join_all(targets.iter().map(|r| self.run_chain(r, event))).await;
        results.into_iter().map(|(result, _)| result).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use eventide_core::clock::SharedClock;
    use eventide_core::notify::{Channel, NotificationHub};
    use eventide_test_support::FixedClock;

    use super::*;
    use crate::backoff::Backoff;
    use crate::dead_letter::{
        DeadLetterReason, FileDeadLetterStore, InMemoryDeadLetterStore, ReplayOptions,
    };
    use crate::error::HandlerError;
    use crate::middleware::test_support::{
        FailingHandler, PanickingHandler, RecordingHandler, event,
    };

    fn clock() -> SharedClock {
        Arc::new(FixedClock::default_instant())
    }

    fn queue() -> Arc<DeadLetterQueue> {
        Arc::new(DeadLetterQueue::new(Arc::new(InMemoryDeadLetterStore::new()), clock()))
    }

    async fn file_queue(path: &std::path::Path) -> Arc<DeadLetterQueue> {
        let store = FileDeadLetterStore::open(path).await.unwrap();
        Arc::new(DeadLetterQueue::new(Arc::new(store), clock()))
    }

    fn no_retry_dispatcher(dead_letters: &Arc<DeadLetterQueue>) -> Dispatcher {
        Dispatcher::builder()
            .retry_policy(RetryPolicy::no_retry())
            .dead_letters(Arc::clone(dead_letters))
            .build()
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Backoff::fixed(Duration::from_millis(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_handler_is_dead_lettered_once_after_three_attempts() {
        // Arrange
        let dead_letters = queue();
        let dispatcher = Dispatcher::builder()
            .retry_policy(quick_retry(3))
            .dead_letters(Arc::clone(&dead_letters))
            .build();
        let handler = Arc::new(FailingHandler::always(HandlerError::Failed("down".into())));
        let id = dispatcher.subscribe(EventMatcher::exact("counter.incremented"), handler.clone());
        let event = event("counter.incremented");

        // Act
        let report = dispatcher.publish(&event).await;

        // Assert
        assert_eq!(handler.calls(), 3);
        assert_eq!(report.failures.len(), 1);
        let entries = dead_letters.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, DeadLetterReason::HandlerError);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].subscription_id, Some(id));
        assert_eq!(entries[0].original_event().unwrap(), event);
    }

    #[tokio::test]
    async fn test_validation_failure_is_dead_lettered_without_retry() {
        let dead_letters = queue();
        let dispatcher = Dispatcher::builder().dead_letters(Arc::clone(&dead_letters)).build();
        let handler = Arc::new(FailingHandler::always(HandlerError::Validation("negative".into())));
        dispatcher.subscribe(EventMatcher::Any, handler.clone());

        dispatcher.publish(&event("counter.decremented")).await;

        assert_eq!(handler.calls(), 1);
        let entries = dead_letters.list(None).await.unwrap();
        assert_eq!(entries[0].reason, DeadLetterReason::ValidationError);
        assert_eq!(entries[0].attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_does_not_block_others() {
        // Arrange
        let dispatcher = Dispatcher::builder().retry_policy(quick_retry(2)).build();
        let healthy = Arc::new(RecordingHandler::named("projector"));
        dispatcher.subscribe(EventMatcher::namespace("counter"), healthy.clone());
        dispatcher.subscribe(
            EventMatcher::exact("counter.incremented"),
            Arc::new(FailingHandler::always(HandlerError::Failed("down".into()))),
        );

        // Act
        let report = dispatcher.publish(&event("counter.incremented")).await;

        // Assert
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler_name, "failing");
        assert_eq!(healthy.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_most_specific_subscription_first() {
        let dispatcher = Dispatcher::default();
        let any = dispatcher.subscribe(EventMatcher::Any, Arc::new(RecordingHandler::named("any")));
        let ns = dispatcher.subscribe(EventMatcher::namespace("counter"), Arc::new(RecordingHandler::named("ns")));
        let exact = dispatcher.subscribe(
            EventMatcher::exact("counter.reset"),
            Arc::new(RecordingHandler::named("exact")),
        );
        dispatcher.subscribe(EventMatcher::exact("other.thing"), Arc::new(RecordingHandler::named("other")));

        let order: Vec<Uuid> = dispatcher.matching("counter.reset").iter().map(|r| r.id).collect();

        assert_eq!(order, vec![exact, ns, any]);
    }

    #[tokio::test]
    async fn test_only_active_subscriptions_receive_events() {
        // Arrange
        let dispatcher = Dispatcher::default();
        let handler = Arc::new(RecordingHandler::named("projector"));
        let id = dispatcher.subscribe(EventMatcher::Any, handler.clone());

        // Act
        dispatcher.pause(id).unwrap();
        dispatcher.publish(&event("counter.incremented")).await;
        dispatcher.resume(id).unwrap();
        dispatcher.publish(&event("counter.incremented")).await;
        dispatcher.complete(id).unwrap();
        dispatcher.publish(&event("counter.incremented")).await;

        // Assert
        assert_eq!(handler.seen().len(), 1);
        assert_eq!(
            dispatcher.resume(id),
            Err(DeliveryError::SubscriptionInactive {
                id,
                state: SubscriptionState::Completed
            })
        );
        assert!(dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.state(id), None);
        assert_eq!(dispatcher.pause(id), Err(DeliveryError::NoSuchSubscription(id)));
    }

    #[tokio::test]
    async fn test_fail_on_dead_letter_moves_subscription_to_failed() {
        let dispatcher = Dispatcher::builder().dead_letters(queue()).build();
        let id = dispatcher.subscribe_with(
            SubscriptionOptions::new(EventMatcher::Any)
                .with_retry(RetryPolicy::no_retry())
                .fail_on_dead_letter(),
            Arc::new(FailingHandler::always(HandlerError::Failed("down".into()))),
        );

        dispatcher.publish(&event("counter.incremented")).await;

        assert_eq!(dispatcher.state(id), Some(SubscriptionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_dead_lettered_as_unknown() {
        // Arrange
        let dead_letters = queue();
        let dispatcher = Dispatcher::builder()
            .retry_policy(RetryPolicy::no_retry())
            .circuit_breaker(CircuitBreakerConfig::default().failure_threshold(1))
            .dead_letters(Arc::clone(&dead_letters))
            .build();
        let handler = Arc::new(FailingHandler::always(HandlerError::Failed("down".into())));
        dispatcher.subscribe(EventMatcher::Any, handler.clone());

        // Act
        dispatcher.publish(&event("counter.incremented")).await;
        dispatcher.publish(&event("counter.incremented")).await;

        // Assert
        assert_eq!(handler.calls(), 1);
        let reasons: Vec<(DeadLetterReason, String)> = dead_letters
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.reason, e.error_type))
            .collect();
        assert!(reasons.contains(&(DeadLetterReason::HandlerError, "HandlerError".to_owned())));
        assert!(reasons.contains(&(DeadLetterReason::Unknown, "CircuitOpen".to_owned())));
    }

    #[tokio::test]
    async fn test_replay_through_dispatcher_drains_queue_after_recovery() {
        // Arrange
        let dead_letters = queue();
        let dispatcher = Dispatcher::builder()
            .retry_policy(RetryPolicy::no_retry())
            .dead_letters(Arc::clone(&dead_letters))
            .build();
        let handler = Arc::new(FailingHandler::times(1, HandlerError::Failed("blip".into())));
        dispatcher.subscribe(EventMatcher::Any, handler.clone());
        dispatcher.publish(&event("counter.incremented")).await;

        // Act
        let report = dead_letters
            .replay_events(&dispatcher, ReplayOptions::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(report.succeeded, 1);
        assert_eq!(handler.calls(), 2);
        assert!(dead_letters.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_to_paused_subscription_fails() {
        let dispatcher = Dispatcher::default();
        let id = dispatcher.subscribe(EventMatcher::Any, Arc::new(RecordingHandler::named("p")));
        dispatcher.pause(id).unwrap();

        let result = dispatcher.replay(Some(id), &event("counter.incremented")).await;

        assert_eq!(
            result,
            Err(DeliveryError::SubscriptionInactive {
                id,
                state: SubscriptionState::Paused
            })
        );
    }

    #[tokio::test]
    async fn test_listen_publishes_notifications_until_stopped() {
        // Arrange
        let dispatcher = Arc::new(Dispatcher::default());
        let handler = Arc::new(RecordingHandler::named("projector"));
        dispatcher.subscribe(EventMatcher::Any, handler.clone());
        let hub = NotificationHub::default();
        let stop = CancellationToken::new();
        let listener = {
            let (dispatcher, subscription, stop) = (Arc::clone(&dispatcher), hub.subscribe(Channel::All), stop.clone());
            tokio::spawn(async move { dispatcher.listen(subscription, stop).await })
        };

        // Act
        hub.publish(&[event("counter.incremented"), event("counter.reset")]);
        while handler.seen().len() < 2 {
            tokio::task::yield_now().await;
        }
        stop.cancel();

        // Assert
        assert_eq!(listener.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered_and_others_still_receive() {
        // Arrange
        let dead_letters = queue();
        let dispatcher = no_retry_dispatcher(&dead_letters);
        let before = Arc::new(RecordingHandler::named("before"));
        let after = Arc::new(RecordingHandler::named("after"));
        dispatcher.subscribe(EventMatcher::Any, before.clone());
        dispatcher.subscribe(EventMatcher::namespace("counter"), Arc::new(PanickingHandler));
        dispatcher.subscribe(EventMatcher::Any, after.clone());

        // Act
        let report = dispatcher.publish(&event("counter.incremented")).await;

        // Assert
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler_name, "panicking");
        assert!(report.failures[0].error.to_string().contains("handler panicked"));
        assert_eq!(before.seen().len(), 1);
        assert_eq!(after.seen().len(), 1);
        let entries = dead_letters.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, DeadLetterReason::HandlerError);
        assert!(entries[0].error_message.contains("projection state poisoned"));
    }

    #[tokio::test]
    async fn test_dead_letters_replay_after_restart_to_matching_subscription() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.json");
        {
            let dead_letters = file_queue(&path).await;
            let dispatcher = no_retry_dispatcher(&dead_letters);
            dispatcher.subscribe(
                EventMatcher::Any,
                Arc::new(FailingHandler::always(HandlerError::Failed("down".into()))),
            );
            dispatcher.publish(&event("counter.incremented")).await;
        }
        let dead_letters = file_queue(&path).await;
        let dispatcher = no_retry_dispatcher(&dead_letters);
        let handler = Arc::new(RecordingHandler::named("projector"));
        dispatcher.subscribe(EventMatcher::Any, handler.clone());

        // Act
        let report = dead_letters
            .replay_events(&dispatcher, ReplayOptions::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(report.succeeded, 1);
        assert_eq!(handler.seen().len(), 1);
        assert!(dead_letters.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_stable_subscription_id_replays_only_to_that_subscription() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.json");
        let id = Uuid::new_v4();
        {
            let dead_letters = file_queue(&path).await;
            let dispatcher = no_retry_dispatcher(&dead_letters);
            dispatcher.subscribe_with(
                SubscriptionOptions::new(EventMatcher::Any).with_id(id),
                Arc::new(FailingHandler::always(HandlerError::Failed("down".into()))),
            );
            dispatcher.publish(&event("counter.incremented")).await;
        }
        let dead_letters = file_queue(&path).await;
        let dispatcher = no_retry_dispatcher(&dead_letters);
        let owner = Arc::new(RecordingHandler::named("owner"));
        let bystander = Arc::new(RecordingHandler::named("bystander"));
        dispatcher.subscribe_with(SubscriptionOptions::new(EventMatcher::Any).with_id(id), owner.clone());
        dispatcher.subscribe(EventMatcher::Any, bystander.clone());

        // Act
        let report = dead_letters
            .replay_events(&dispatcher, ReplayOptions::default())
            .await
            .unwrap();

        // Assert
        assert_eq!(report.succeeded, 1);
        assert_eq!(owner.seen().len(), 1);
        assert!(bystander.seen().is_empty());
    }

    #[tokio::test]
    async fn test_replay_for_unknown_subscription_without_matches_fails() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe(EventMatcher::exact("other.thing"), Arc::new(RecordingHandler::named("p")));
        let id = Uuid::new_v4();

        let result = dispatcher.replay(Some(id), &event("counter.incremented")).await;

        assert_eq!(result, Err(DeliveryError::NoSuchSubscription(id)));
    }

    #[tokio::test]
    async fn test_resubscribing_after_unsubscribe_starts_with_closed_circuit() {
        // Arrange
        let dispatcher = Dispatcher::builder()
            .retry_policy(RetryPolicy::no_retry())
            .circuit_breaker(CircuitBreakerConfig::default().failure_threshold(1))
            .build();
        let id = Uuid::new_v4();
        let options = SubscriptionOptions::new(EventMatcher::Any).with_id(id);
        dispatcher.subscribe_with(
            options.clone(),
            Arc::new(FailingHandler::always(HandlerError::Failed("down".into()))),
        );
        dispatcher.publish(&event("counter.incremented")).await;

        // Act
        assert!(dispatcher.unsubscribe(id));
        let handler = Arc::new(RecordingHandler::named("projector"));
        dispatcher.subscribe_with(options, handler.clone());
        let report = dispatcher.publish(&event("counter.incremented")).await;

        // Assert
        assert!(report.is_clean());
        assert_eq!(handler.seen().len(), 1);
        assert_eq!(dispatcher.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_notifies_every_middleware() {
        #[derive(Default)]
        struct Forgetful(parking_lot::Mutex<Vec<Uuid>>);

        #[async_trait]
        impl Middleware for Forgetful {
            fn name(&self) -> &'static str {
                "forgetful"
            }

            async fn handle(&self, ctx: &DeliveryContext<'_>, next: Next<'_>) -> Result<(), DeliveryError> {
                next.run(ctx).await
            }

            fn subscription_removed(&self, subscription_id: Uuid) {
                self.0.lock().push(subscription_id);
            }
        }

        let forgetful = Arc::new(Forgetful::default());
        let dispatcher = Dispatcher::builder().middleware(forgetful.clone()).build();
        let id = dispatcher.subscribe(EventMatcher::Any, Arc::new(RecordingHandler::named("p")));

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));

        assert_eq!(*forgetful.0.lock(), vec![id]);
    }
}
