//! Bulkhead isolation.
//!
//! # Responsibilities
//! - Own one counting semaphore per named pool
//! - Admit a call only if a permit is free right now (no queueing)
//!
//! # Design Decisions
//! - Permits are `OwnedSemaphorePermit`s held by a guard; dropping the guard,
//!   including on cancellation, returns the permit
//! - Re-creating an existing pool replaces it; permits held on the old pool
//!   are returned to the old semaphore

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::schema::BulkheadPoolConfig;
use crate::observability::metrics;
use crate::resilience::error::ResilienceError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BulkheadError {
    #[error("Bulkhead pool '{0}' is full")]
    Full(String),

    #[error("Bulkhead pool '{0}' does not exist")]
    UnknownPool(String),
}

impl<E> From<BulkheadError> for ResilienceError<E> {
    fn from(err: BulkheadError) -> Self {
        match err {
            BulkheadError::Full(pool) => ResilienceError::BulkheadFull { pool },
            BulkheadError::UnknownPool(pool) => ResilienceError::UnknownPool(pool),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub acquired: u64,
    pub rejected: u64,
}

/// A named semaphore with admission counters.
pub struct ResourcePool {
    name: String,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    acquired: AtomicU64,
    rejected: AtomicU64,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            acquired: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                metrics::record_bulkhead(&self.name, "acquired", self.in_flight());
                Ok(BulkheadPermit { _permit: permit })
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pool = %self.name,
                    max_concurrent = self.max_concurrent,
                    "Bulkhead pool full, rejecting call"
                );
                metrics::record_bulkhead(&self.name, "rejected", self.in_flight());
                Err(BulkheadError::Full(self.name.clone()))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.max_concurrent,
            in_flight: self.in_flight(),
            acquired: self.acquired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Held while a call runs inside a pool.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
pub struct BulkheadManager {
    pools: DashMap<String, Arc<ResourcePool>>,
}

impl BulkheadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(pools: &[BulkheadPoolConfig]) -> Self {
        let manager = Self::new();
        for pool in pools {
            manager.create_pool(&pool.name, pool.max_concurrent);
        }
        manager
    }

    pub fn create_pool(&self, name: &str, max_concurrent: usize) {
        tracing::info!(pool = %name, max_concurrent, "Bulkhead pool created");
        self.pools
            .insert(name.to_string(), Arc::new(ResourcePool::new(name, max_concurrent)));
    }

    pub fn pool(&self, name: &str) -> Option<Arc<ResourcePool>> {
        self.pools.get(name).map(|p| p.clone())
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Take a permit from `pool` without waiting.
    pub fn try_acquire(&self, pool: &str) -> Result<BulkheadPermit, BulkheadError> {
        let pool = self
            .pool(pool)
            .ok_or_else(|| BulkheadError::UnknownPool(pool.to_string()))?;
        pool.try_acquire()
    }

    /// Run `fut` while holding a permit of `pool`.
    pub async fn execute<T, E, Fut>(&self, pool: &str, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.try_acquire(pool)?;
        fut.await.map_err(ResilienceError::Inner)
    }

    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|p| (p.key().clone(), p.value().stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_third_call_rejected_while_two_in_flight() {
        let manager = Arc::new(BulkheadManager::new());
        manager.create_pool("db", 2);

        let mut releases = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.execute("db", async move {
                    let _ = rx.await;
                    Ok::<(), String>(())
                })
                .await
            }));
        }
        while manager.pool("db").unwrap().in_flight() < 2 {
            tokio::task::yield_now().await;
        }

        let rejected = manager.execute("db", async { Ok::<(), String>(()) }).await;
        assert!(matches!(rejected, Err(ResilienceError::BulkheadFull { ref pool }) if pool == "db"));

        releases.pop().unwrap().send(()).unwrap();
        while manager.pool("db").unwrap().in_flight() > 1 {
            tokio::task::yield_now().await;
        }
        assert!(manager.execute("db", async { Ok::<(), String>(()) }).await.is_ok());

        releases.pop().unwrap().send(()).unwrap();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stats = manager.stats()["db"];
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_error_and_cancel() {
        let manager = BulkheadManager::from_config(&[BulkheadPoolConfig {
            name: "llm".into(),
            max_concurrent: 1,
        }]);

        let failed = manager.execute("llm", async { Err::<(), _>("boom") }).await;
        assert!(matches!(failed, Err(ResilienceError::Inner("boom"))));
        assert_eq!(manager.pool("llm").unwrap().in_flight(), 0);

        let pending = manager.execute("llm", std::future::pending::<Result<(), String>>());
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert_eq!(manager.pool("llm").unwrap().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let manager = BulkheadManager::new();
        let err = manager.execute("nope", async { Ok::<(), String>(()) }).await.unwrap_err();
        assert!(matches!(err, ResilienceError::UnknownPool(ref p) if p == "nope"));
        assert_eq!(manager.try_acquire("nope").unwrap_err(), BulkheadError::UnknownPool("nope".into()));
    }
}
