//! Fault tolerance orchestrator.
//!
//! # Data Flow
//! ```text
//! execute(service, op)
//!     → resolve ServicePolicy (configured, or [Retry] by default)
//!     → Fallback        (outermost: recovers whatever surfaces below)
//!     → CircuitBreaker  (one outcome per execute, rejects while Open)
//!     → Retry           (re-runs the attempt with backoff)
//!     → Bulkhead        (non-blocking permit for each attempt)
//!     → Timeout         (innermost deadline around op)
//!     → op
//! final error → FailureDetector::record_failure
//! ```
//!
//! # Design Decisions
//! - Every service has a breaker; `Strategy::CircuitBreaker` only marks it explicitly
//! - Per-call options override the policy and enable their layer
//! - The breaker sits outside retry so an exhausted retry counts as one failure

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::schema::{ResilienceConfig, ServicePolicyConfig};
use crate::discovery::unix_millis;
use crate::health::{HealthMonitor, HealthProbe, HealthReport};
use crate::observability::metrics;
use crate::resilience::bulkhead::{BulkheadError, BulkheadManager, PoolStats, ResourcePool};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::resilience::error::ResilienceError;
use crate::resilience::failure_detector::{FailureDetector, FailureStatistics, FailureType};
use crate::resilience::fallback::{FallbackHandler, FallbackManager, FallbackStats};
use crate::resilience::retries::{RetryManager, RetryPolicy, RetryStats};
use crate::resilience::timeouts::TimeoutManager;

/// Fault tolerance layers a service can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Timeout,
    Bulkhead,
    Retry,
    CircuitBreaker,
    Fallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Timeout => "timeout",
            Strategy::Bulkhead => "bulkhead",
            Strategy::Retry => "retry",
            Strategy::CircuitBreaker => "circuit_breaker",
            Strategy::Fallback => "fallback",
        }
    }
}

/// How calls to one service are protected.
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    /// Enabled layers. Order is irrelevant; layering is fixed.
    pub strategies: Vec<Strategy>,
    pub timeout: Option<Duration>,
    pub bulkhead_pool: Option<String>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ServicePolicy {
    pub fn new(strategies: impl IntoIterator<Item = Strategy>) -> Self {
        Self {
            strategies: strategies.into_iter().collect(),
            timeout: None,
            bulkhead_pool: None,
            retry: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.enable(Strategy::Timeout);
        self.timeout = Some(timeout);
        self
    }

    pub fn with_bulkhead_pool(mut self, pool: impl Into<String>) -> Self {
        self.enable(Strategy::Bulkhead);
        self.bulkhead_pool = Some(pool.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.enable(Strategy::Retry);
        self.retry = Some(policy);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.enable(Strategy::CircuitBreaker);
        self.circuit_breaker = config;
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.enable(Strategy::Fallback);
        self
    }

    pub fn has(&self, strategy: Strategy) -> bool {
        self.strategies.contains(&strategy)
    }

    /// Build from a `[[services]]` entry; breaker thresholds default to `breaker_defaults`.
    pub fn from_config(config: &ServicePolicyConfig, breaker_defaults: &CircuitBreakerConfig) -> Self {
        let mut policy = Self::new([]);
        policy.circuit_breaker = breaker_defaults.clone();
        if let Some(secs) = config.timeout_secs {
            policy = policy.with_timeout(Duration::from_secs(secs));
        }
        if let Some(pool) = &config.bulkhead_pool {
            policy = policy.with_bulkhead_pool(pool.clone());
        }
        if let Some(retry) = &config.retry {
            policy = policy.with_retry(RetryPolicy::from(retry));
        }
        if let Some(breaker) = &config.circuit_breaker {
            policy = policy.with_circuit_breaker(CircuitBreakerConfig::from(breaker));
        }
        if config.fallback {
            policy = policy.with_fallback();
        }
        policy
    }

    fn enable(&mut self, strategy: Strategy) {
        if !self.has(strategy) {
            self.strategies.push(strategy);
        }
    }
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self::new([Strategy::Retry])
    }
}

/// Per-call overrides. Each present field also enables its layer.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub bulkhead_pool: Option<String>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_bulkhead_pool(mut self, pool: impl Into<String>) -> Self {
        self.bulkhead_pool = Some(pool.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

/// Everything the statistics surface exposes, in one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub health: HealthReport,
    pub failures: FailureStatistics,
    pub retry: BTreeMap<String, RetryStats>,
    pub fallback: BTreeMap<String, FallbackStats>,
    pub timeout: BTreeMap<String, u64>,
    pub bulkhead: BTreeMap<String, PoolStats>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    pub requests: BTreeMap<String, RequestStats>,
    pub timestamp: u64,
}

/// Layers resolved for one call.
struct Plan {
    timeout: Option<Duration>,
    pool: Option<Arc<ResourcePool>>,
    retry: Option<RetryPolicy>,
    fallback: bool,
    strategies: String,
}

pub struct FaultToleranceManager {
    policies: DashMap<String, ServicePolicy>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    requests: DashMap<String, RequestStats>,
    default_breaker: CircuitBreakerConfig,
    retries: RetryManager,
    timeouts: TimeoutManager,
    bulkheads: BulkheadManager,
    fallbacks: FallbackManager,
    detector: Arc<FailureDetector>,
    monitor: Arc<HealthMonitor>,
}

impl FaultToleranceManager {
    pub fn new() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        let default_breaker = CircuitBreakerConfig::from(&config.circuit_breaker);
        let manager = Self {
            policies: DashMap::new(),
            breakers: DashMap::new(),
            requests: DashMap::new(),
            retries: RetryManager::new(RetryPolicy::from(&config.retries)),
            timeouts: TimeoutManager::new(Duration::from_secs(config.timeouts.default_secs)),
            bulkheads: BulkheadManager::from_config(&config.bulkheads),
            fallbacks: FallbackManager::new(),
            detector: Arc::new(FailureDetector::from_config(&config.failure_detection)),
            monitor: Arc::new(HealthMonitor::new(config.health_monitor.tick())),
            default_breaker,
        };
        for service in &config.services {
            let policy = ServicePolicy::from_config(service, &manager.default_breaker);
            manager.configure_policy(&service.name, policy);
        }
        manager
    }

    /// Enable `strategies` for `service` with default parameters.
    pub fn configure_service(&self, service: &str, strategies: impl IntoIterator<Item = Strategy>) {
        let mut policy = ServicePolicy::new(strategies);
        policy.circuit_breaker = self.default_breaker.clone();
        self.configure_policy(service, policy);
    }

    /// Install a full policy. The service's breaker restarts Closed.
    pub fn configure_policy(&self, service: &str, policy: ServicePolicy) {
        let names: Vec<&str> = policy.strategies.iter().map(Strategy::as_str).collect();
        tracing::info!(service = %service, strategies = ?names, "Fault tolerance configured");
        self.breakers.remove(service);
        self.policies.insert(service.to_string(), policy);
    }

    pub fn policy(&self, service: &str) -> Option<ServicePolicy> {
        self.policies.get(service).map(|p| p.clone())
    }

    pub fn register_fallback<T, E, H>(&self, service: &str, handler: H)
    where
        T: 'static,
        E: 'static,
        H: FallbackHandler<T, E> + 'static,
    {
        self.fallbacks.register(service, handler);
    }

    pub fn create_pool(&self, name: &str, max_concurrent: usize) {
        self.bulkheads.create_pool(name, max_concurrent);
    }

    pub fn register_health_check(&self, probe: HealthProbe) {
        self.monitor.register(probe);
    }

    /// Spawn the health monitor loop.
    pub fn start_monitoring(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.monitor.clone().run(shutdown))
    }

    /// The breaker guarding `service`, created on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        let config = self
            .policies
            .get(service)
            .map(|p| p.circuit_breaker.clone())
            .unwrap_or_else(|| self.default_breaker.clone());
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone()
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn bulkheads(&self) -> &BulkheadManager {
        &self.bulkheads
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub fn fallbacks(&self) -> &FallbackManager {
        &self.fallbacks
    }

    /// Run `op` under the layers configured for `service`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        service: &str,
        options: ExecuteOptions,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: 'static,
        E: Display + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_lifted(service, options, || {
            let fut = op();
            async { fut.await.map_err(ResilienceError::Inner) }
        })
        .await
    }

    /// [`execute`](Self::execute) for operations that already return `ResilienceError`,
    /// e.g. ones that select an instance per attempt.
    pub async fn execute_lifted<T, E, F, Fut>(
        &self,
        service: &str,
        options: ExecuteOptions,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: 'static,
        E: Display + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let start = Instant::now();
        let plan = self.plan(service, options);

        let result = match &plan {
            Ok(plan) => self.guarded(service, plan, op).await,
            Err(e) => Err(e.clone().into()),
        };

        let result = match result {
            Ok(value) => Ok(value),
            Err(error) => {
                let failure_type = FailureType::classify(&error);
                let context = BTreeMap::from([
                    ("error_kind".to_string(), error_kind(&error).to_string()),
                    (
                        "strategies".to_string(),
                        plan.as_ref().map(|p| p.strategies.clone()).unwrap_or_default(),
                    ),
                ]);
                self.detector
                    .record_failure(service, failure_type, error.to_string(), context);

                match &plan {
                    Ok(plan) if plan.fallback => self.fallbacks.recover(service, error).await,
                    _ => Err(error),
                }
            }
        };

        let success = result.is_ok();
        {
            let mut stats = self.requests.entry(service.to_string()).or_default();
            stats.total += 1;
            if success {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
        }
        metrics::record_request(service, success, start);
        result
    }

    /// Breaker around retry around bulkhead and timeout.
    async fn guarded<T, E, F, Fut>(&self, service: &str, plan: &Plan, mut op: F) -> Result<T, ResilienceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let breaker = self.breaker(service);
        if !breaker.is_request_allowed() {
            tracing::warn!(service = %service, "Circuit open, rejecting call");
            return Err(ResilienceError::CircuitOpen {
                name: service.to_string(),
            });
        }

        let pool = plan.pool.as_deref();
        let attempt = || self.attempt(service, pool, plan.timeout, op());

        let result = match &plan.retry {
            Some(policy) => match self.retries.execute(service, policy, attempt).await {
                Err(last) if policy.max_attempts > 1 => Err(ResilienceError::RetriesExhausted {
                    operation: service.to_string(),
                    attempts: policy.max_attempts,
                    last: Box::new(last),
                }),
                other => other,
            },
            None => {
                let mut attempt = attempt;
                attempt().await
            }
        };

        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                breaker.record_failure(FailureType::classify(e));
            }
        }
        result
    }

    /// One attempt: bulkhead permit, then the deadline.
    async fn attempt<T, E, Fut>(
        &self,
        service: &str,
        pool: Option<&ResourcePool>,
        timeout: Option<Duration>,
        fut: Fut,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let _permit = match pool {
            Some(pool) => Some(pool.try_acquire()?),
            None => None,
        };
        match timeout {
            Some(timeout) => self.timeouts.guard(service, Some(timeout), fut).await,
            None => fut.await,
        }
    }

    fn plan(&self, service: &str, options: ExecuteOptions) -> Result<Plan, BulkheadError> {
        let policy = self.policy(service).unwrap_or_default();

        let timeout = match options.timeout {
            Some(t) => Some(t),
            None if policy.has(Strategy::Timeout) => {
                Some(policy.timeout.unwrap_or_else(|| self.timeouts.default_timeout()))
            }
            None => None,
        };

        let pool_name = match options.bulkhead_pool {
            Some(name) => Some(name),
            None if policy.has(Strategy::Bulkhead) => policy.bulkhead_pool.clone(),
            None => None,
        };
        let pool = match pool_name {
            Some(name) => Some(
                self.bulkheads
                    .pool(&name)
                    .ok_or(BulkheadError::UnknownPool(name))?,
            ),
            None => None,
        };

        let retry = match options.retry {
            Some(r) => Some(r),
            None if policy.has(Strategy::Retry) => Some(
                policy
                    .retry
                    .clone()
                    .unwrap_or_else(|| self.retries.default_policy().clone()),
            ),
            None => None,
        };

        let strategies = policy
            .strategies
            .iter()
            .map(Strategy::as_str)
            .collect::<Vec<_>>()
            .join(",");

        Ok(Plan {
            timeout,
            pool,
            retry,
            fallback: policy.has(Strategy::Fallback),
            strategies,
        })
    }

    pub fn request_stats(&self) -> BTreeMap<String, RequestStats> {
        self.requests.iter().map(|r| (r.key().clone(), *r.value())).collect()
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            health: self.monitor.status(),
            failures: self.detector.statistics(),
            retry: self.retries.all_stats(),
            fallback: self.fallbacks.stats(),
            timeout: self.timeouts.stats(),
            bulkhead: self.bulkheads.stats(),
            circuit_breakers: self
                .breakers
                .iter()
                .map(|b| (b.key().clone(), b.value().snapshot()))
                .collect(),
            requests: self.request_stats(),
            timestamp: unix_millis(),
        }
    }
}

impl Default for FaultToleranceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn error_kind<E>(error: &ResilienceError<E>) -> &'static str {
    match error {
        ResilienceError::ServiceUnavailable(_) => "service_unavailable",
        ResilienceError::CircuitOpen { .. } => "circuit_open",
        ResilienceError::Timeout { .. } => "timeout",
        ResilienceError::BulkheadFull { .. } => "bulkhead_full",
        ResilienceError::UnknownPool(_) => "unknown_pool",
        ResilienceError::RetriesExhausted { .. } => "retries_exhausted",
        ResilienceError::Inner(_) => "inner",
    }
}
