//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (services reference existing bulkhead pools)
//! - Validate value ranges (thresholds > 0, delays ordered, URLs parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{
    BackendKind, CircuitBreakerSettings, ResilienceConfig, RetrySettings,
};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.discovery.backend == BackendKind::Consul
        && url::Url::parse(&config.discovery.consul.address).is_err()
    {
        errors.push(ValidationError::new(
            "discovery.consul.address",
            format!("invalid URL '{}'", config.discovery.consul.address),
        ));
    }

    let hc = &config.health_check;
    if hc.tick_ms == 0 {
        errors.push(ValidationError::new("health_check.tick_ms", "must be > 0"));
    }
    if hc.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be > 0"));
    }
    if hc.timeout_secs == 0 {
        errors.push(ValidationError::new("health_check.timeout_secs", "must be > 0"));
    }
    if !(100..=599).contains(&hc.expected_status) {
        errors.push(ValidationError::new(
            "health_check.expected_status",
            format!("{} is not an HTTP status code", hc.expected_status),
        ));
    }

    validate_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);
    validate_retry("retries", &config.retries, &mut errors);

    if config.timeouts.default_secs == 0 {
        errors.push(ValidationError::new("timeouts.default_secs", "must be > 0"));
    }

    let mut pools = HashSet::new();
    for (i, pool) in config.bulkheads.iter().enumerate() {
        if pool.max_concurrent == 0 {
            errors.push(ValidationError::new(
                format!("bulkheads[{}].max_concurrent", i),
                "must be > 0",
            ));
        }
        if !pools.insert(pool.name.as_str()) {
            errors.push(ValidationError::new(
                format!("bulkheads[{}].name", i),
                format!("duplicate pool '{}'", pool.name),
            ));
        }
    }

    if config.failure_detection.consecutive_failure_threshold == 0 {
        errors.push(ValidationError::new(
            "failure_detection.consecutive_failure_threshold",
            "must be > 0",
        ));
    }
    if config.health_monitor.tick_ms == 0 {
        errors.push(ValidationError::new("health_monitor.tick_ms", "must be > 0"));
    }

    for (i, service) in config.services.iter().enumerate() {
        let prefix = format!("services[{}]", i);
        if service.name.is_empty() {
            errors.push(ValidationError::new(format!("{}.name", prefix), "must not be empty"));
        }
        if service.timeout_secs == Some(0) {
            errors.push(ValidationError::new(format!("{}.timeout_secs", prefix), "must be > 0"));
        }
        if let Some(pool) = &service.bulkhead_pool {
            if !pools.contains(pool.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.bulkhead_pool", prefix),
                    format!("unknown pool '{}'", pool),
                ));
            }
        }
        if let Some(retry) = &service.retry {
            validate_retry(&format!("{}.retry", prefix), retry, &mut errors);
        }
        if let Some(cb) = &service.circuit_breaker {
            validate_breaker(&format!("{}.circuit_breaker", prefix), cb, &mut errors);
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }
    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_retry(prefix: &str, retry: &RetrySettings, errors: &mut Vec<ValidationError>) {
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new(format!("{}.max_attempts", prefix), "must be > 0"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new(
            format!("{}.base_delay_ms", prefix),
            "must not exceed max_delay_ms",
        ));
    }
    if !(retry.exponential_base >= 1.0) {
        errors.push(ValidationError::new(
            format!("{}.exponential_base", prefix),
            "must be >= 1.0",
        ));
    }
}

fn validate_breaker(
    prefix: &str,
    cb: &CircuitBreakerSettings,
    errors: &mut Vec<ValidationError>,
) {
    if cb.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.failure_threshold", prefix), "must be > 0"));
    }
    if cb.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.success_threshold", prefix), "must be > 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BulkheadPoolConfig, ServicePolicyConfig};

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ResilienceConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ResilienceConfig::default();
        config.retries.max_attempts = 0;
        config.retries.exponential_base = 0.5;
        config.circuit_breaker.failure_threshold = 0;
        config.bulkheads.push(BulkheadPoolConfig {
            name: "db".into(),
            max_concurrent: 0,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_unknown_pool_reference() {
        let mut config = ResilienceConfig::default();
        config.services.push(ServicePolicyConfig {
            name: "payments".into(),
            bulkhead_pool: Some("missing".into()),
            ..Default::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "services[0].bulkhead_pool");
    }

    #[test]
    fn test_consul_address_checked() {
        let mut config = ResilienceConfig::default();
        config.discovery.backend = BackendKind::Consul;
        config.discovery.consul.address = "not a url".into();
        assert!(validate_config(&config).is_err());
    }
}
