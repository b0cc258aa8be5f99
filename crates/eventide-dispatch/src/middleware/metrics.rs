//! Delivery metrics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{DeliveryContext, Middleware, Next};
use crate::error::DeliveryError;

/// Point-in-time counters for one handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Handler invocations.
    pub attempts: u64,
    /// Invocations that returned `Ok`.
    pub successes: u64,
    /// Invocations that returned an error.
    pub failures: u64,
    /// Failure count per error tag.
    pub errors: BTreeMap<String, u64>,
    /// Sum of invocation latencies.
    pub total_latency: Duration,
    /// Slowest invocation.
    pub max_latency: Duration,
}

impl MetricsSnapshot {
    /// Mean invocation latency, or zero if nothing ran.
    #[must_use]
    pub fn mean_latency(&self) -> Duration {
        u32::try_from(self.attempts)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total_latency / n)
    }
}

/// Per-handler delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    handlers: Mutex<HashMap<String, MetricsSnapshot>>,
}

impl DeliveryMetrics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation.
    pub fn record(&self, handler: &str, latency: Duration, outcome: Result<(), &str>) {
        let mut handlers = self.handlers.lock();
        let entry = handlers.entry(handler.to_owned()).or_default();
        entry.attempts += 1;
        entry.total_latency += latency;
        entry.max_latency = entry.max_latency.max(latency);
        match outcome {
            Ok(()) => entry.successes += 1,
            Err(tag) => {
                entry.failures += 1;
                *entry.errors.entry(tag.to_owned()).or_default() += 1;
            }
        }
    }

    /// Counters for `handler`, if it has run.
    #[must_use]
    pub fn snapshot(&self, handler: &str) -> Option<MetricsSnapshot> {
        self.handlers.lock().get(handler).cloned()
    }

    /// Counters for every handler, ordered by name.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.handlers
            .lock()
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
            .collect()
    }
}

/// Times and counts each handler invocation. Never changes the outcome.
#[derive(Debug, Clone)]
pub struct MetricsMiddleware {
    metrics: Arc<DeliveryMetrics>,
}

impl MetricsMiddleware {
    /// Records into `metrics`.
    #[must_use]
    pub fn new(metrics: Arc<DeliveryMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, ctx: &DeliveryContext<'_>, next: Next<'_>) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let result = next.run(ctx).await;
        let latency = started.elapsed();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(()) => {
                self.metrics.record(ctx.handler_name, latency, Ok(()));
                tracing::debug!(
                    handler = ctx.handler_name,
                    event_type = %ctx.event.event_type,
                    latency_ms,
                    "handler succeeded"
                );
            }
            Err(err) => {
                self.metrics.record(ctx.handler_name, latency, Err(err.kind()));
                tracing::warn!(
                    handler = ctx.handler_name,
                    event_type = %ctx.event.event_type,
                    subscription_id = %ctx.subscription_id,
                    error_kind = err.kind(),
                    error = %err,
                    latency_ms,
                    "handler failed"
                );
            }
        }
        result
    }
}
