//! Retry middleware.

use async_trait::async_trait;

use super::{DeliveryContext, Middleware, Next};
use crate::error::DeliveryError;

/// Re-runs the rest of the chain on transient handler failures, following
/// the subscription's [`RetryPolicy`](crate::backoff::RetryPolicy). Only
/// the final failure propagates. Permanent failures, an open circuit and
/// cancellation are returned immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMiddleware;

fn is_retryable(err: &DeliveryError) -> bool {
    matches!(err, DeliveryError::Handler(e) if !e.is_permanent())
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(&self, ctx: &DeliveryContext<'_>, next: Next<'_>) -> Result<(), DeliveryError> {
        let policy = ctx.retry;
        let mut attempt = 1;
        loop {
            let err = match next.run(ctx).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !is_retryable(&err) || attempt >= policy.max_attempts {
                return Err(err);
            }

            let delay = policy.backoff.delay_for(attempt);
            tracing::debug!(
                subscription_id = %ctx.subscription_id,
                handler = ctx.handler_name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying handler"
            );
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(DeliveryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::backoff::{Backoff, RetryPolicy};
    use crate::error::HandlerError;
    use crate::middleware::test_support::{FailingHandler, event};

    fn chain() -> Vec<Arc<dyn Middleware>> {
        vec![Arc::new(RetryMiddleware)]
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        // Arrange
        let handler = FailingHandler::times(2, HandlerError::Failed("flaky".into()));
        let event = event("counter.incremented");
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Backoff::fixed(Duration::from_millis(50)));
        let ctx = DeliveryContext::new(&event, Uuid::new_v4(), "failing", policy, &cancel);
        let chain = chain();

        // Act
        let result = Next::new(&chain, &handler).run(&ctx).await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(handler.calls(), 3);
        assert_eq!(ctx.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_failure_propagates_after_max_attempts() {
        let handler = FailingHandler::always(HandlerError::Failed("down".into()));
        let event = event("counter.incremented");
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(3, Backoff::exponential(Duration::from_millis(10)));
        let ctx = DeliveryContext::new(&event, Uuid::new_v4(), "failing", policy, &cancel);
        let chain = chain();

        let result = Next::new(&chain, &handler).run(&ctx).await;

        assert_eq!(result, Err(DeliveryError::Handler(HandlerError::Failed("down".into()))));
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let handler = FailingHandler::always(HandlerError::Deserialization("bad".into()));
        let event = event("counter.incremented");
        let cancel = CancellationToken::new();
        let ctx = DeliveryContext::new(&event, Uuid::new_v4(), "failing", RetryPolicy::default(), &cancel);
        let chain = chain();

        let result = Next::new(&chain, &handler).run(&ctx).await;

        assert!(matches!(
            result,
            Err(DeliveryError::Handler(HandlerError::Deserialization(_)))
        ));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_backoff() {
        let handler = FailingHandler::always(HandlerError::Failed("down".into()));
        let event = event("counter.incremented");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(5, Backoff::fixed(Duration::from_secs(60)));
        let ctx = DeliveryContext::new(&event, Uuid::new_v4(), "failing", policy, &cancel);
        let chain = chain();

        let result = Next::new(&chain, &handler).run(&ctx).await;

        assert_eq!(result, Err(DeliveryError::Cancelled));
        assert_eq!(handler.calls(), 1);
    }
}
