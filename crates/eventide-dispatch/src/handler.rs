//! Event handler contract and type matching.

use std::future::Future;

use async_trait::async_trait;
use eventide_core::event::RecordedEvent;

use crate::error::HandlerError;

/// Reacts to persisted events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Processes one event.
    async fn handle(&self, event: &RecordedEvent) -> Result<(), HandlerError>;
}

/// Closure-backed handler. The closure receives an owned copy of each
/// event so the returned future can be `'static`.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(RecordedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(RecordedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &RecordedEvent) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Which event types a subscription receives.
///
/// Event types are dotted names such as `order.line.added`. A namespace
/// matcher for `order.line` or `order` also receives that type, which is how
/// handlers subscribe to a family of events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventMatcher {
    /// Exactly this event type.
    Exact(String),
    /// Every event type inside this dotted namespace.
    Namespace(String),
    /// Every event.
    Any,
}

impl EventMatcher {
    /// Shorthand for [`EventMatcher::Exact`].
    #[must_use]
    pub fn exact(event_type: impl Into<String>) -> Self {
        Self::Exact(event_type.into())
    }

    /// Shorthand for [`EventMatcher::Namespace`].
    #[must_use]
    pub fn namespace(prefix: impl Into<String>) -> Self {
        Self::Namespace(prefix.into())
    }

    /// Returns `true` if `event_type` is selected.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(t) => t == event_type,
            Self::Namespace(prefix) => event_type
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.')),
            Self::Any => true,
        }
    }

    /// Ordering key: higher is more specific. Exact beats any namespace,
    /// deeper namespaces beat shallower ones, `Any` comes last.
    #[must_use]
    pub fn specificity(&self) -> usize {
        match self {
            Self::Exact(_) => usize::MAX,
            Self::Namespace(prefix) => prefix.split('.').count(),
            Self::Any => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_matches_on_segment_boundaries() {
        let matcher = EventMatcher::namespace("order.line");
        assert!(matcher.matches("order.line"));
        assert!(matcher.matches("order.line.added"));
        assert!(!matcher.matches("order.lines.added"));
        assert!(!matcher.matches("order"));
    }

    #[test]
    fn test_specificity_orders_exact_then_deeper_namespaces_then_any() {
        let mut matchers = vec![
            EventMatcher::Any,
            EventMatcher::namespace("order"),
            EventMatcher::exact("order.line.added"),
            EventMatcher::namespace("order.line"),
        ];

        matchers.sort_by_key(|m| std::cmp::Reverse(m.specificity()));

        assert_eq!(
            matchers,
            vec![
                EventMatcher::exact("order.line.added"),
                EventMatcher::namespace("order.line"),
                EventMatcher::namespace("order"),
                EventMatcher::Any,
            ]
        );
    }

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        // Arrange
        let handler = FnHandler::new("rejects", |event: RecordedEvent| async move {
            Err(HandlerError::Validation(event.event_type))
        });
        let event = eventide_core::event::NewEvent::new(
            "Counter",
            "counter.reset",
            serde_json::Value::Null,
            chrono::Utc::now(),
        )
        .record("c-1", 1);

        // Act
        let result = handler.handle(&event).await;

        // Assert
        assert_eq!(handler.name(), "rejects");
        assert_eq!(result, Err(HandlerError::Validation("counter.reset".into())));
    }
}
