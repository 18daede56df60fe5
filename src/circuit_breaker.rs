//! Single-threaded circuit breaker.
//!
//! The breaker lives inside one [`RetryScheduler`](crate::RetryScheduler) and is only touched from
//! the host thread, so state sits in `Cell`s rather than atomics.
//!
//! Transitions:
//! - **Closed → Open** once `consecutive_failures >= failure_threshold`.
//! - **Open → HalfOpen** lazily, inside [`can_attempt`](CircuitBreaker::can_attempt), once the
//!   reset timeout has elapsed. There is no background timer.
//! - **HalfOpen → Closed** on the probe's success (both counters reset).
//! - **HalfOpen → Open** on the probe's failure, independent of the threshold.
//!
//! While half-open exactly one probe is outstanding: the call that performed the transition gets
//! `true`, every later call gets `false` until the probe settles.

use crate::clock::{Clock, MonotonicClock};
use serde::Serialize;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits attempts until the reset timeout elapses.
    Open,
    /// One probe is allowed through to test recovery.
    HalfOpen,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    reset_timeout: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Reset timeout must be > 0.
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { failure_threshold, reset_timeout })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Time to stay Open before a half-open probe is allowed.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

/// Point-in-time view of the breaker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub failure_count: usize,
    /// How long the breaker has been open, when it is open or half-open.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Cell<CircuitState>,
    consecutive_failures: Cell<usize>,
    failure_count: Cell<usize>,
    last_failure_at: Cell<Option<u64>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Cell::new(CircuitState::Closed),
            consecutive_failures: Cell::new(0),
            failure_count: Cell::new(0),
            last_failure_at: Cell::new(None),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.get()
    }

    /// Whether a new attempt may start now. Performs the lazy Open → HalfOpen transition.
    pub fn can_attempt(&self) -> bool {
        match self.state.get() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                if self.reset_elapsed() {
                    self.state.set(CircuitState::HalfOpen);
                    tracing::info!(
                        failures = self.failure_count.get(),
                        "Circuit breaker → half-open"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Same answer as [`can_attempt`](Self::can_attempt) without changing state.
    pub fn would_attempt(&self) -> bool {
        match self.state.get() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => self.reset_elapsed(),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.set(0);
        if self.state.get() == CircuitState::HalfOpen {
            self.failure_count.set(0);
            self.last_failure_at.set(None);
            self.state.set(CircuitState::Closed);
            tracing::info!("Circuit breaker → closed");
        }
    }

    pub fn record_failure(&self) {
        let consecutive = self.consecutive_failures.get().saturating_add(1);
        let total = self.failure_count.get().saturating_add(1);
        self.consecutive_failures.set(consecutive);
        self.failure_count.set(total);

        match self.state.get() {
            CircuitState::HalfOpen => {
                self.trip();
                tracing::warn!(failures = total, "Circuit breaker: probe failed → open");
            }
            _ if consecutive >= self.config.failure_threshold => {
                let was_open = self.state.get() == CircuitState::Open;
                self.trip();
                if !was_open {
                    tracing::error!(
                        failures = consecutive,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                }
            }
            _ => {}
        }
    }

    /// Administrative override: back to Closed with zeroed counters.
    pub fn reset(&self) {
        self.state.set(CircuitState::Closed);
        self.consecutive_failures.set(0);
        self.failure_count.set(0);
        self.last_failure_at.set(None);
        tracing::info!("Circuit breaker reset → closed");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let open_for = match self.state.get() {
            CircuitState::Closed => None,
            _ => Some(self.open_for()),
        };
        BreakerSnapshot {
            state: self.state.get(),
            consecutive_failures: self.consecutive_failures.get(),
            failure_count: self.failure_count.get(),
            open_for,
        }
    }

    /// Time since the failure that (re)opened the breaker.
    pub fn open_for(&self) -> Duration {
        match self.last_failure_at.get() {
            Some(at) => Duration::from_millis(self.clock.now_millis().saturating_sub(at)),
            None => Duration::ZERO,
        }
    }

    fn trip(&self) {
        self.state.set(CircuitState::Open);
        self.last_failure_at.set(Some(self.clock.now_millis()));
    }

    fn reset_elapsed(&self) -> bool {
        let reset_ms = u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX);
        match self.last_failure_at.get() {
            Some(at) => self.clock.now_millis().saturating_sub(at) >= reset_ms,
            None => true,
        }
    }
}
