//! Retry with exponential backoff.
//!
//! # Responsibilities
//! - Re-run a failing operation up to `max_attempts` times
//! - Wait `calculate_backoff(attempt)` between attempts
//! - Count per-operation attempt outcomes for the statistics surface
//!
//! # Design Decisions
//! - The final error is returned unchanged; wrapping is the caller's choice
//! - Every error is retried; callers that need selective retry classify before calling

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::schema::RetrySettings;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay,
            self.max_delay,
            self.exponential_base,
            self.jitter,
        )
    }
}

/// Attempt counters for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Attempts that succeeded.
    pub success: u64,
    /// Attempts that failed.
    pub failure: u64,
    /// Executions that ran out of attempts.
    pub exhausted: u64,
}

pub struct RetryManager {
    default_policy: RetryPolicy,
    stats: DashMap<String, RetryStats>,
}

impl RetryManager {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            stats: DashMap::new(),
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run `op` until it succeeds or `policy.max_attempts` attempts failed.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    self.stats.entry(operation.to_string()).or_default().success += 1;
                    if attempt > 1 {
                        tracing::info!(operation = %operation, attempt, "Operation succeeded after retry");
                        metrics::record_retry(operation, "recovered", attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.stats.entry(operation.to_string()).or_default().failure += 1;

                    if attempt >= max_attempts {
                        self.stats.entry(operation.to_string()).or_default().exhausted += 1;
                        tracing::error!(
                            operation = %operation,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        metrics::record_retry(operation, "exhausted", attempt);
                        return Err(e);
                    }

                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Same as [`execute`](Self::execute) with the default policy.
    pub async fn execute_default<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let policy = self.default_policy.clone();
        self.execute(operation, &policy, op).await
    }

    pub fn stats(&self, operation: &str) -> RetryStats {
        self.stats.get(operation).map(|s| *s).unwrap_or_default()
    }

    pub fn all_stats(&self) -> BTreeMap<String, RetryStats> {
        self.stats.iter().map(|s| (s.key().clone(), *s.value())).collect()
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
