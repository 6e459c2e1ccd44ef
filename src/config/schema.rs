//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the resilience layer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::load_balancer::Strategy as LoadBalancingStrategy;

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Registry backend selection.
    pub discovery: DiscoveryConfig,

    /// Instance health checking defaults.
    pub health_check: HealthCheckSettings,

    /// Load balancing strategy selection.
    pub load_balancer: LoadBalancerConfig,

    /// Default circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerSettings,

    /// Default retry policy.
    pub retries: RetrySettings,

    /// Timeout defaults.
    pub timeouts: TimeoutSettings,

    /// Bulkhead pools created at startup.
    pub bulkheads: Vec<BulkheadPoolConfig>,

    /// Failure escalation thresholds.
    pub failure_detection: FailureDetectionConfig,

    /// Process-level health monitor.
    pub health_monitor: HealthMonitorConfig,

    /// Per-service fault tolerance strategies.
    pub services: Vec<ServicePolicyConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Which registry backend stores instances.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local map.
    #[default]
    Memory,
    /// Consul agent HTTP API.
    Consul,
}

/// Registry backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Backend kind.
    pub backend: BackendKind,

    /// Consul connection settings (used when `backend = "consul"`).
    pub consul: ConsulConfig,
}

/// Consul agent connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent base URL (e.g., "http://127.0.0.1:8500").
    pub address: String,

    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            timeout_secs: 5,
        }
    }
}

/// Health check defaults applied to instances registered without explicit values.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    /// Enable the instance health checker loop.
    pub enabled: bool,

    /// Scheduler tick of the checker loop in milliseconds.
    pub tick_ms: u64,

    /// Default probe interval in seconds.
    pub interval_secs: u64,

    /// Default probe timeout in seconds.
    pub timeout_secs: u64,

    /// Deregister an instance that stays unhealthy this long.
    pub deregister_after_secs: u64,

    /// Expected HTTP status of a healthy probe.
    pub expected_status: u16,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 1000,
            interval_secs: 10,
            timeout_secs: 5,
            deregister_after_secs: 60,
            expected_status: 200,
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Strategy used when a service has no override.
    pub strategy: LoadBalancingStrategy,

    /// Per-service strategy overrides.
    pub overrides: Vec<StrategyOverride>,
}

/// Strategy override for a single logical service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyOverride {
    pub service: String,
    pub strategy: LoadBalancingStrategy,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Failures in Closed state before tripping.
    pub failure_threshold: u32,

    /// Seconds in Open state before a trial call is allowed.
    pub recovery_timeout_secs: u64,

    /// Consecutive HalfOpen successes needed to close.
    pub success_threshold: u32,

    /// Per-call timeout applied to calls guarded by the breaker.
    pub call_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 3,
            call_timeout_secs: 30,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    pub exponential_base: f64,

    /// Scale each delay by a random factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Deadline used when a Timeout strategy gives none, in seconds.
    pub default_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { default_secs: 30 }
    }
}

/// A named bulkhead pool.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BulkheadPoolConfig {
    pub name: String,
    pub max_concurrent: usize,
}

/// Failure escalation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailureDetectionConfig {
    /// Unresolved failures within the window that trigger escalation.
    pub consecutive_failure_threshold: usize,

    /// Trailing window in seconds.
    pub window_secs: u64,
}

impl Default for FailureDetectionConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            window_secs: 300,
        }
    }
}

/// Process-level health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    pub enabled: bool,

    /// Loop tick in milliseconds; probes run when their own interval elapsed.
    pub tick_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 1000,
        }
    }
}

/// Fault tolerance strategies for one logical service.
///
/// Each present section enables the matching layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServicePolicyConfig {
    pub name: String,

    /// Enable the timeout layer with this deadline.
    pub timeout_secs: Option<u64>,

    /// Enable the bulkhead layer using this pool.
    pub bulkhead_pool: Option<String>,

    /// Enable retries with this policy.
    pub retry: Option<RetrySettings>,

    /// Override the implicit circuit breaker thresholds.
    pub circuit_breaker: Option<CircuitBreakerSettings>,

    /// Consult the registered fallback handler on failure.
    pub fallback: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin endpoints.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

impl HealthCheckSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl HealthMonitorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
