//! Process-level health state.
//!
//! # States
//! - Healthy: every enabled check passes
//! - Degraded: at least one check fails
//! - Critical: a check has failed `CRITICAL_CONSECUTIVE_FAILURES` times in a row
//! - Unhealthy: per-check state after a failed run
//! - Unknown: check registered but not run yet
//!
//! # Design Decisions
//! - Per-check results are kept even when the check is disabled
//! - Overall status is derived on read, never stored

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consecutive failures at which a failing check makes the system Critical.
pub const CRITICAL_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Latest outcome of one registered probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    /// Time of the last run (ms since epoch); `None` before the first run.
    pub last_check: Option<u64>,
    pub consecutive_failures: u32,
    pub enabled: bool,
    /// Error text from the last failed run.
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn new(check_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            name: name.into(),
            status: HealthStatus::Unknown,
            last_check: None,
            consecutive_failures: 0,
            enabled: true,
            message: None,
        }
    }

    pub fn record_success(&mut self, at: u64) {
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.last_check = Some(at);
        self.message = None;
    }

    pub fn record_failure(&mut self, at: u64, message: impl Into<String>) {
        self.status = HealthStatus::Unhealthy;
        self.consecutive_failures += 1;
        self.last_check = Some(at);
        self.message = Some(message.into());
    }
}

/// Aggregated health of all registered probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checks: BTreeMap<String, HealthCheckResult>,
    /// Report time (ms since epoch).
    pub timestamp: u64,
}

/// Fold per-check results into the overall status. Disabled checks are ignored.
pub fn aggregate<'a, I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a HealthCheckResult>,
{
    let mut overall = HealthStatus::Healthy;
    for result in results {
        if !result.enabled || result.status != HealthStatus::Unhealthy {
            continue;
        }
        if result.consecutive_failures >= CRITICAL_CONSECUTIVE_FAILURES {
            return HealthStatus::Critical;
        }
        overall = HealthStatus::Degraded;
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(id: &str, times: u32) -> HealthCheckResult {
        let mut r = HealthCheckResult::new(id, id);
        for _ in 0..times {
            r.record_failure(0, "down");
        }
        r
    }

    #[test]
    fn test_aggregate_states() {
        let mut ok = HealthCheckResult::new("db", "db");
        ok.record_success(1);
        let unknown = HealthCheckResult::new("cache", "cache");

        assert_eq!(aggregate([&ok, &unknown]), HealthStatus::Healthy);
        assert_eq!(aggregate([&ok, &failing("q", 1)]), HealthStatus::Degraded);
        assert_eq!(aggregate([&failing("q", 2), &failing("r", 3)]), HealthStatus::Critical);
        assert_eq!(aggregate(std::iter::empty()), HealthStatus::Healthy);
    }

    #[test]
    fn test_disabled_checks_do_not_count() {
        let mut muted = failing("legacy", 5);
        muted.enabled = false;
        let mut ok = HealthCheckResult::new("db", "db");
        ok.record_success(1);

        assert_eq!(aggregate([&ok, &muted]), HealthStatus::Healthy);
        assert_eq!(aggregate([&muted, &failing("q", 1)]), HealthStatus::Degraded);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut r = failing("db", 4);
        assert_eq!(r.consecutive_failures, 4);
        r.record_success(10);
        assert_eq!(r.consecutive_failures, 0);
        assert_eq!(r.status, HealthStatus::Healthy);
        assert!(r.message.is_none());
    }
}
