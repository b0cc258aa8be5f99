//! Retry policy and backoff schedules.

use std::time::Duration;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// The same delay before every retry.
    Fixed,
    /// `base * 2^(n-1)` before retry `n`.
    #[default]
    Exponential,
    /// `base * fib(n)` before retry `n` (1, 1, 2, 3, 5, ...).
    Fibonacci,
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(format!("unknown backoff {other:?}, expected fixed, exponential or fibonacci")),
        }
    }
}

/// Delay schedule between handler attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Curve shape.
    pub kind: BackoffKind,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Proportional jitter in `[0.0, 1.0]`: a delay `d` becomes a uniform
    /// sample in `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl Backoff {
    /// Constant delay.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Doubling delay from `base_delay`.
    #[must_use]
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
            ..Self::default()
        }
    }

    /// Fibonacci-scaled delay from `base_delay`.
    #[must_use]
    pub fn fibonacci(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fibonacci,
            base_delay,
            ..Self::default()
        }
    }

    /// Sets the cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets proportional jitter, clamped to `[0.0, 1.0]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1 = first retry), without jitter.
    #[must_use]
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let factor: u64 = match self.kind {
            BackoffKind::Fixed => 1,
            BackoffKind::Exponential => 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX),
            BackoffKind::Fibonacci => fibonacci(retry),
        };
        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`, with jitter applied and capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

/// How often and how patiently a subscription's handler is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` (clamped to at least 1).
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::fixed(Duration::ZERO))
    }
}
