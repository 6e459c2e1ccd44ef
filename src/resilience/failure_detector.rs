//! Failure recording, classification and escalation.
//!
//! # Responsibilities
//! - Keep an append-only log of failures per service
//! - Classify errors into a small taxonomy for aggregation
//! - Escalate when unresolved failures pile up inside the trailing window
//!
//! # Design Decisions
//! - Records are never removed; `resolved` flips exactly once
//! - Escalation handlers run synchronously after the record is stored;
//!   their errors and panics are logged and swallowed

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::schema::FailureDetectionConfig;
use crate::discovery::unix_millis;
use crate::observability::metrics;
use crate::resilience::error::ResilienceError;

/// Failure taxonomy used for aggregation and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Timeout,
    Connection,
    RateLimit,
    ServerError,
    ResourceExhausted,
    DependencyFailure,
}

impl FailureType {
    pub const ALL: [FailureType; 6] = [
        FailureType::Timeout,
        FailureType::Connection,
        FailureType::RateLimit,
        FailureType::ServerError,
        FailureType::ResourceExhausted,
        FailureType::DependencyFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Timeout => "timeout",
            FailureType::Connection => "connection",
            FailureType::RateLimit => "rate_limit",
            FailureType::ServerError => "server_error",
            FailureType::ResourceExhausted => "resource_exhausted",
            FailureType::DependencyFailure => "dependency_failure",
        }
    }

    /// Classify an error surfaced by the execution pipeline.
    pub fn classify<E: Display>(error: &ResilienceError<E>) -> Self {
        match error {
            ResilienceError::Timeout { .. } => FailureType::Timeout,
            ResilienceError::BulkheadFull { .. } | ResilienceError::UnknownPool(_) => {
                FailureType::ResourceExhausted
            }
            ResilienceError::CircuitOpen { .. } | ResilienceError::ServiceUnavailable(_) => {
                FailureType::DependencyFailure
            }
            ResilienceError::RetriesExhausted { last, .. } => Self::classify(last),
            ResilienceError::Inner(e) => Self::classify_message(&e.to_string()),
        }
    }

    /// Heuristic classification of an arbitrary error message.
    pub fn classify_message(message: &str) -> Self {
        let message = message.to_lowercase();
        // Specific causes first: "connection pool resource exhausted" is not a connection failure
        if message.contains("timed out") || message.contains("timeout") {
            FailureType::Timeout
        } else if message.contains("rate limit") {
            FailureType::RateLimit
        } else if message.contains("resource") {
            FailureType::ResourceExhausted
        } else if message.contains("connection") || message.contains("refused") {
            FailureType::Connection
        } else {
            FailureType::ServerError
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub id: String,
    pub service_name: String,
    pub failure_type: FailureType,
    /// ms since epoch.
    pub timestamp: u64,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub resolved: bool,
    pub resolution_time: Option<u64>,
    #[serde(skip)]
    recorded_at: Instant,
}

/// Filter for [`FailureDetector::failures`]. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailureQuery {
    pub service: Option<String>,
    pub failure_type: Option<FailureType>,
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
}

impl FailureQuery {
    fn matches(&self, record: &FailureRecord) -> bool {
        self.service.as_deref().map_or(true, |s| record.service_name == s)
            && self.failure_type.map_or(true, |t| record.failure_type == t)
            && self.resolved.map_or(true, |r| record.resolved == r)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceFailureStats {
    pub total: u64,
    pub resolved: u64,
    pub unresolved: u64,
    pub types: BTreeMap<FailureType, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureStatistics {
    pub total_failures: u64,
    pub service_statistics: BTreeMap<String, ServiceFailureStats>,
    pub timestamp: u64,
}

/// Payload handed to escalation handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub service_name: String,
    pub pattern: &'static str,
    pub unresolved_in_window: usize,
}

pub type EscalationError = Box<dyn std::error::Error + Send + Sync>;
pub type EscalationHandler = Arc<dyn Fn(&Escalation) -> Result<(), EscalationError> + Send + Sync>;

pub struct FailureDetector {
    records: RwLock<Vec<FailureRecord>>,
    handlers: RwLock<Vec<EscalationHandler>>,
    threshold: usize,
    window: Duration,
}

impl FailureDetector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            threshold,
            window,
        }
    }

    pub fn from_config(config: &FailureDetectionConfig) -> Self {
        Self::new(
            config.consecutive_failure_threshold,
            Duration::from_secs(config.window_secs),
        )
    }

    /// Add an escalation handler (alerting, failover...).
    pub fn on_escalation<F>(&self, handler: F)
    where
        F: Fn(&Escalation) -> Result<(), EscalationError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("escalation handlers lock poisoned")
            .push(Arc::new(handler));
    }

    /// Append a failure and check the escalation pattern. Returns the record id.
    pub fn record_failure(
        &self,
        service_name: &str,
        failure_type: FailureType,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> String {
        let record = FailureRecord {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: service_name.to_string(),
            failure_type,
            timestamp: unix_millis(),
            message: message.into(),
            context,
            resolved: false,
            resolution_time: None,
            recorded_at: Instant::now(),
        };
        let id = record.id.clone();

        tracing::error!(
            service = %service_name,
            failure_type = %failure_type,
            failure_id = %id,
            message = %record.message,
            "Failure recorded"
        );
        metrics::record_failure(service_name, failure_type.as_str());

        self.records
            .write()
            .expect("failure log lock poisoned")
            .push(record);

        self.check_patterns(service_name);
        id
    }

    /// Mark a failure resolved. False if unknown or already resolved.
    pub fn resolve_failure(&self, failure_id: &str) -> bool {
        let mut records = self.records.write().expect("failure log lock poisoned");
        let Some(record) = records.iter_mut().find(|r| r.id == failure_id && !r.resolved) else {
            return false;
        };
        record.resolved = true;
        record.resolution_time = Some(unix_millis());
        tracing::info!(service = %record.service_name, failure_id = %failure_id, "Failure resolved");
        true
    }

    /// Unresolved failures of a service inside the trailing window.
    pub fn recent_unresolved(&self, service_name: &str) -> usize {
        let now = Instant::now();
        self.records
            .read()
            .expect("failure log lock poisoned")
            .iter()
            .filter(|r| {
                r.service_name == service_name
                    && !r.resolved
                    && now.duration_since(r.recorded_at) <= self.window
            })
            .count()
    }

    /// Matching records, newest first.
    pub fn failures(&self, query: &FailureQuery) -> Vec<FailureRecord> {
        let records = self.records.read().expect("failure log lock poisoned");
        let matching = records.iter().rev().filter(|r| query.matches(r)).cloned();
        match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Totals grouped by service and type.
    pub fn statistics(&self) -> FailureStatistics {
        let records = self.records.read().expect("failure log lock poisoned");
        let mut service_statistics: BTreeMap<String, ServiceFailureStats> = BTreeMap::new();
        for record in records.iter() {
            let stats = service_statistics.entry(record.service_name.clone()).or_default();
            stats.total += 1;
            if record.resolved {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            *stats.types.entry(record.failure_type).or_default() += 1;
        }
        FailureStatistics {
            total_failures: records.len() as u64,
            service_statistics,
            timestamp: unix_millis(),
        }
    }

    fn check_patterns(&self, service_name: &str) {
        let unresolved = self.recent_unresolved(service_name);
        if unresolved < self.threshold {
            return;
        }

        tracing::error!(
            service = %service_name,
            unresolved,
            window_secs = self.window.as_secs(),
            "Consecutive failures detected, escalating"
        );

        let escalation = Escalation {
            service_name: service_name.to_string(),
            pattern: "consecutive_failures",
            unresolved_in_window: unresolved,
        };
        let handlers: Vec<EscalationHandler> = self
            .handlers
            .read()
            .expect("escalation handlers lock poisoned")
            .clone();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&escalation))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(service = %service_name, error = %e, "Escalation handler failed");
                }
                Err(_) => {
                    tracing::error!(service = %service_name, "Escalation handler panicked");
                }
            }
        }
    }
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::from_config(&FailureDetectionConfig::default())
    }
}
