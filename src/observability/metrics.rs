//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the resilience metrics (requests, breaker state, retries, bulkheads, health)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `resilience_requests_total` (counter): fault-tolerant executions by service, outcome
//! - `resilience_request_duration_seconds` (histogram): execution latency by service
//! - `resilience_circuit_state` (gauge): 0=closed, 1=open, 2=half_open
//! - `resilience_retry_outcomes_total` (counter): retried operations by outcome
//! - `resilience_timeouts_total` (counter): deadline expiries by operation
//! - `resilience_bulkhead_permits_total` (counter): acquired/rejected by pool
//! - `resilience_bulkhead_in_flight` (gauge): held permits by pool
//! - `resilience_fallbacks_total` (counter): fallback invocations by service, outcome
//! - `resilience_failures_total` (counter): recorded failures by service, type
//! - `resilience_instance_health` (gauge): 1=healthy, 0=otherwise
//! - `resilience_health_check_status` (gauge): 1=passing, 0=failing

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

/// One fault-tolerant execution finished.
pub fn record_request(service: &str, success: bool, start: Instant) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        "resilience_requests_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "resilience_request_duration_seconds",
        "service" => service.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

/// Breaker state changed (0=closed, 1=open, 2=half_open).
pub fn record_circuit_state(name: &str, state: u8) {
    metrics::gauge!("resilience_circuit_state", "name" => name.to_string()).set(state as f64);
}

/// A retried operation finished with `outcome` ("success" or "exhausted").
pub fn record_retry(operation: &str, outcome: &'static str, attempts: u32) {
    metrics::counter!(
        "resilience_retry_outcomes_total",
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "resilience_retry_attempts",
        "operation" => operation.to_string()
    )
    .record(attempts as f64);
}

pub fn record_timeout(operation: &str) {
    metrics::counter!("resilience_timeouts_total", "operation" => operation.to_string()).increment(1);
}

/// Permit outcome for a bulkhead pool ("acquired" or "rejected").
pub fn record_bulkhead(pool: &str, outcome: &'static str, in_flight: usize) {
    metrics::counter!(
        "resilience_bulkhead_permits_total",
        "pool" => pool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::gauge!("resilience_bulkhead_in_flight", "pool" => pool.to_string()).set(in_flight as f64);
}

pub fn record_fallback(service: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        "resilience_fallbacks_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_failure(service: &str, failure_type: &'static str) {
    metrics::counter!(
        "resilience_failures_total",
        "service" => service.to_string(),
        "type" => failure_type
    )
    .increment(1);
}

pub fn record_instance_health(service: &str, instance_id: &str, healthy: bool) {
    metrics::gauge!(
        "resilience_instance_health",
        "service" => service.to_string(),
        "instance" => instance_id.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check(check_id: &str, healthy: bool) {
    metrics::gauge!("resilience_health_check_status", "check" => check_id.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}
