//! Circuit breaker middleware.
//!
//! ## States
//!
//! - **Closed**: deliveries pass through; consecutive failures are counted.
//! - **Open**: deliveries fail fast with `CircuitOpen` until the reset
//!   timeout elapses.
//! - **Half-Open**: one trial delivery is let through. Success closes the
//!   circuit, failure opens it again.
//!
//! Each subscription gets its own breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{DeliveryContext, Middleware, Next};
use crate::error::DeliveryError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Deliveries pass through normally.
    Closed,
    /// Deliveries are rejected.
    Open,
    /// A trial delivery decides whether to close again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial delivery.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold (at least 1).
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A single circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed circuit.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current state, moving Open to Half-Open if the timeout has elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Asks to run one delivery. Returns `false` if it must fail fast.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if inner.trial_in_flight => false,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
        }
    }

    /// Records a successful delivery.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Records a failed delivery.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                Self::open(&mut inner);
                tracing::warn!(circuit = %self.name, "trial delivery failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Releases a trial slot without recording an outcome.
    fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn open(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.reset_timeout)
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!(circuit = %self.name, "circuit half-open");
        }
    }
}

/// Per-subscription circuit breakers around the rest of the chain.
#[derive(Debug, Default)]
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<Uuid, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerMiddleware {
    /// Creates the middleware; breakers are created on first delivery.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker guarding `subscription_id`.
    pub fn circuit(&self, subscription_id: Uuid) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.circuits
                .lock()
                .entry(subscription_id)
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(subscription_id.to_string(), self.config))
                }),
        )
    }

    /// Number of subscriptions with a breaker.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.circuits.lock().len()
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn handle(&self, ctx: &DeliveryContext<'_>, next: Next<'_>) -> Result<(), DeliveryError> {
        let circuit = self.circuit(ctx.subscription_id);
        if !circuit.try_acquire() {
            tracing::debug!(
                subscription_id = %ctx.subscription_id,
                handler = ctx.handler_name,
                "circuit open, failing fast"
            );
            return Err(DeliveryError::CircuitOpen(ctx.subscription_id));
        }
        let result = next.run(ctx).await;
        match &result {
            Ok(()) => circuit.record_success(),
            Err(DeliveryError::Handler(_)) => circuit.record_failure(),
            Err(_) => circuit.release(),
        }
        result
    }

    fn subscription_removed(&self, subscription_id: Uuid) {
        if self.circuits.lock().remove(&subscription_id).is_some() {
            tracing::debug!(%subscription_id, "circuit breaker dropped");
        }
    }
}
