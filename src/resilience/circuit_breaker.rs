//! Circuit breaker per named operation.
//!
//! # States
//! - Closed: calls pass through, classified failures are counted
//! - Open: calls are rejected without touching the dependency
//! - HalfOpen: trial calls pass through
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → HalfOpen: now - last_failure >= recovery_timeout (checked on the next call)
//! HalfOpen → Closed: success_threshold consecutive successes
//! HalfOpen → Open: any failure
//! ```
//!
//! # Design Decisions
//! - Every transition happens under one mutex, so concurrent calls cannot double-trip
//! - HalfOpen does not limit concurrency; each trial result is counted
//! - Failures outside `expected_failures` propagate without touching the state

use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerSettings;
use crate::observability::metrics;
use crate::resilience::error::ResilienceError;
use crate::resilience::failure_detector::FailureType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge value exported for this state.
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Classified failures in Closed state before tripping.
    pub failure_threshold: u32,
    /// Time in Open state before a trial call is let through.
    pub recovery_timeout: Duration,
    /// Consecutive HalfOpen successes needed to close.
    pub success_threshold: u32,
    /// Deadline applied by [`CircuitBreaker::call`].
    pub call_timeout: Duration,
    /// Failure types that count; `None` counts all of them.
    pub expected_failures: Option<HashSet<FailureType>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs),
            success_threshold: settings.success_threshold,
            call_timeout: Duration::from_secs(settings.call_timeout_secs),
            expected_failures: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Only count these failure types.
    pub fn with_expected_failures<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = FailureType>,
    {
        self.expected_failures = Some(types.into_iter().collect());
        self
    }

    fn counts(&self, failure_type: FailureType) -> bool {
        self.expected_failures
            .as_ref()
            .map_or(true, |expected| expected.contains(&failure_type))
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::record_circuit_state(&name, CircuitState::Closed.as_gauge());
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed. Moves Open to HalfOpen once the recovery timeout elapsed.
    pub fn is_request_allowed(&self) -> bool {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = state
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.failure_count = 0;
                    self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
                }
                recovered
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            // A call admitted before the trip finished late.
            CircuitState::Open => {}
        }
    }

    /// Record a failure of the given type. Returns whether it counted.
    pub fn record_failure(&self, failure_type: FailureType) -> bool {
        if !self.config.counts(failure_type) {
            tracing::debug!(
                breaker = %self.name,
                failure_type = %failure_type,
                "Failure not counted by circuit breaker"
            );
            return false;
        }

        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.last_failure_time = Some(now);
                    self.transitioned(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.last_failure_time = Some(now);
                state.failure_count = 1;
                state.success_count = 0;
                self.transitioned(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        true
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("circuit breaker mutex poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().expect("circuit breaker mutex poisoned").failure_count
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        let previous = state.state;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
        if previous != CircuitState::Closed {
            self.transitioned(previous, CircuitState::Closed);
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock().expect("circuit breaker mutex poisoned");
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }

    /// Run `fut` under the breaker with the configured call timeout.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, ResilienceError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.is_request_allowed() {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            });
        }

        let result = match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ResilienceError::Inner(e)),
            Err(_) => Err(ResilienceError::Timeout {
                operation: self.name.clone(),
                timeout: self.config.call_timeout,
            }),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                self.record_failure(FailureType::classify(e));
            }
        }
        result
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, from = %from, to = %to, "Circuit breaker opened")
            }
            _ => tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed"),
        }
        metrics::record_circuit_state(&self.name, to.as_gauge());
    }
}
