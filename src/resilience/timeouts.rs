//! Timeout enforcement.
//!
//! # Responsibilities
//! - Race an operation against a deadline
//! - Count deadline expiries per operation
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; the losing future is dropped, not awaited
//! - Timeout errors are distinct from the operation's own errors

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::observability::metrics;
use crate::resilience::error::ResilienceError;

pub struct TimeoutManager {
    default_timeout: Duration,
    timeouts: DashMap<String, u64>,
}

impl TimeoutManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            timeouts: DashMap::new(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Await `fut` for at most `timeout` (or the default).
    pub async fn execute<T, E, Fut>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        fut: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard(operation, timeout, async { fut.await.map_err(ResilienceError::Inner) })
            .await
    }

    /// Like [`execute`](Self::execute) for futures already speaking `ResilienceError`.
    pub async fn guard<T, E, Fut>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        fut: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                *self.timeouts.entry(operation.to_string()).or_default() += 1;
                tracing::warn!(
                    operation = %operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Operation timed out"
                );
                metrics::record_timeout(operation);
                Err(ResilienceError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    pub fn timeout_count(&self, operation: &str) -> u64 {
        self.timeouts.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn stats(&self) -> BTreeMap<String, u64> {
        self.timeouts.iter().map(|c| (c.key().clone(), *c.value())).collect()
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
