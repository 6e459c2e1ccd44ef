//! Process-level health monitor.
//!
//! # Responsibilities
//! - Hold arbitrary boolean probes (database ping, queue depth...) by id
//! - Run each enabled probe on its own interval with a bounded timeout
//! - Aggregate results into an overall `HealthReport`
//!
//! A probe that errors, panics or times out counts as a failed run; the loop never stops on it.

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::discovery::unix_millis;
use crate::health::state::{aggregate, HealthCheckResult, HealthReport};
use crate::observability::metrics;

/// Error a probe may return.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed probe: resolves to `Ok(true)` when healthy.
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, ProbeError>> + Send + Sync>;

/// A registered probe and its schedule.
#[derive(Clone)]
pub struct HealthProbe {
    pub id: String,
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub enabled: bool,
    check: ProbeFn,
}

impl HealthProbe {
    pub fn new<F, Fut>(id: impl Into<String>, interval: Duration, timeout: Duration, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ProbeError>> + Send + 'static,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            interval,
            timeout,
            enabled: true,
            check: Arc::new(move || check().boxed()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .finish()
    }
}

struct ProbeEntry {
    probe: HealthProbe,
    last_run: Option<Instant>,
}

/// Runs registered probes and keeps their latest results.
pub struct HealthMonitor {
    probes: DashMap<String, ProbeEntry>,
    results: DashMap<String, HealthCheckResult>,
    tick: Duration,
}

impl HealthMonitor {
    pub fn new(tick: Duration) -> Self {
        Self {
            probes: DashMap::new(),
            results: DashMap::new(),
            tick,
        }
    }

    /// Register or replace a probe. Replacing resets its result.
    pub fn register(&self, probe: HealthProbe) {
        tracing::info!(check_id = %probe.id, interval_secs = probe.interval.as_secs(), "Health check registered");
        let mut result = HealthCheckResult::new(&probe.id, &probe.name);
        result.enabled = probe.enabled;
        self.results.insert(probe.id.clone(), result);
        self.probes.insert(
            probe.id.clone(),
            ProbeEntry {
                probe,
                last_run: None,
            },
        );
    }

    pub fn unregister(&self, check_id: &str) -> bool {
        self.results.remove(check_id);
        self.probes.remove(check_id).is_some()
    }

    /// Enable or disable a probe. Returns `false` for unknown ids.
    pub fn set_enabled(&self, check_id: &str, enabled: bool) -> bool {
        let Some(mut entry) = self.probes.get_mut(check_id) else {
            return false;
        };
        entry.probe.enabled = enabled;
        drop(entry);
        if let Some(mut result) = self.results.get_mut(check_id) {
            result.enabled = enabled;
        }
        true
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "Health monitor starting");

        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Run every enabled probe that is due. Returns how many ran.
    pub async fn run_once(&self) -> usize {
        let now = Instant::now();
        let due: Vec<HealthProbe> = self
            .probes
            .iter_mut()
            .filter_map(|mut entry| {
                if !entry.probe.enabled {
                    return None;
                }
                let is_due = entry
                    .last_run
                    .map(|last| now.duration_since(last) >= entry.probe.interval)
                    .unwrap_or(true);
                if !is_due {
                    return None;
                }
                entry.last_run = Some(now);
                Some(entry.probe.clone())
            })
            .collect();

        let outcomes = join_all(due.iter().map(execute)).await;

        let ran = due.len();
        for (probe, outcome) in due.iter().zip(outcomes) {
            let at = unix_millis();
            let healthy = outcome.is_ok();
            if let Some(mut result) = self.results.get_mut(&probe.id) {
                match outcome {
                    Ok(()) => result.record_success(at),
                    Err(message) => result.record_failure(at, message),
                }
            }
            metrics::record_health_check(&probe.id, healthy);
        }
        ran
    }

    /// Run one probe now regardless of its schedule.
    pub async fn check_now(&self, check_id: &str) -> Option<HealthCheckResult> {
        let probe = self.probes.get(check_id)?.probe.clone();
        let outcome = execute(&probe).await;
        let mut result = self.results.get_mut(check_id)?;
        let at = unix_millis();
        match outcome {
            Ok(()) => result.record_success(at),
            Err(message) => result.record_failure(at, message),
        }
        metrics::record_health_check(check_id, result.consecutive_failures == 0);
        Some(result.clone())
    }

    pub fn result(&self, check_id: &str) -> Option<HealthCheckResult> {
        self.results.get(check_id).map(|r| r.clone())
    }

    /// Aggregated report over every registered probe.
    pub fn status(&self) -> HealthReport {
        let checks: std::collections::BTreeMap<String, HealthCheckResult> = self
            .results
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        HealthReport {
            overall_status: aggregate(checks.values()),
            checks,
            timestamp: unix_millis(),
        }
    }
}

async fn execute(probe: &HealthProbe) -> Result<(), String> {
    let run = AssertUnwindSafe((probe.check)()).catch_unwind();
    match time::timeout(probe.timeout, run).await {
        Ok(Ok(Ok(true))) => Ok(()),
        Ok(Ok(Ok(false))) => Err("check reported unhealthy".to_string()),
        Ok(Ok(Err(e))) => {
            tracing::error!(check_id = %probe.id, error = %e, "Health check failed");
            Err(e.to_string())
        }
        Ok(Err(_)) => {
            tracing::error!(check_id = %probe.id, "Health check panicked");
            Err("check panicked".to_string())
        }
        Err(_) => {
            tracing::warn!(check_id = %probe.id, timeout_ms = probe.timeout.as_millis() as u64, "Health check timed out");
            Err("check timed out".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthStatus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn flag_probe(id: &str, flag: Arc<AtomicBool>) -> HealthProbe {
        HealthProbe::new(id, Duration::from_secs(1), Duration::from_millis(100), move || {
            let flag = flag.clone();
            async move { Ok::<bool, ProbeError>(flag.load(Ordering::SeqCst)) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_status_transitions() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        let db = Arc::new(AtomicBool::new(true));
        let cache = Arc::new(AtomicBool::new(true));
        monitor.register(flag_probe("db", db.clone()));
        monitor.register(flag_probe("cache", cache.clone()));

        assert_eq!(monitor.run_once().await, 2);
        assert_eq!(monitor.status().overall_status, HealthStatus::Healthy);

        cache.store(false, Ordering::SeqCst);
        time::advance(Duration::from_secs(1)).await;
        monitor.run_once().await;
        assert_eq!(monitor.status().overall_status, HealthStatus::Degraded);

        for _ in 0..2 {
            time::advance(Duration::from_secs(1)).await;
            monitor.run_once().await;
        }
        let report = monitor.status();
        assert_eq!(report.overall_status, HealthStatus::Critical);
        assert_eq!(report.checks["cache"].consecutive_failures, 3);
        assert_eq!(report.checks["db"].status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_and_disable() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        monitor.register(HealthProbe::new(
            "slow",
            Duration::from_secs(5),
            Duration::from_secs(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<bool, ProbeError>(true) }
            },
        ));

        monitor.run_once().await;
        time::advance(Duration::from_secs(1)).await;
        monitor.run_once().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(monitor.set_enabled("slow", false));
        time::advance(Duration::from_secs(5)).await;
        assert_eq!(monitor.run_once().await, 0);
        assert!(!monitor.status().checks["slow"].enabled);
        assert!(!monitor.set_enabled("missing", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_failing_check_restores_overall_health() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.register(flag_probe("db", Arc::new(AtomicBool::new(true))));
        monitor.register(flag_probe("legacy", Arc::new(AtomicBool::new(false))));

        for _ in 0..3 {
            monitor.run_once().await;
            time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(monitor.status().overall_status, HealthStatus::Critical);

        assert!(monitor.set_enabled("legacy", false));
        let report = monitor.status();
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        // The last result is still reported
        assert_eq!(report.checks["legacy"].status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_error_and_panic_count_as_failures() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.register(HealthProbe::new(
            "hang",
            Duration::from_secs(1),
            Duration::from_millis(50),
            || async {
                time::sleep(Duration::from_secs(60)).await;
                Ok::<bool, ProbeError>(true)
            },
        ));
        monitor.register(HealthProbe::new(
            "error",
            Duration::from_secs(1),
            Duration::from_secs(1),
            || async { Err::<bool, ProbeError>("db unreachable".into()) },
        ));
        monitor.register(HealthProbe::new(
            "panic",
            Duration::from_secs(1),
            Duration::from_secs(1),
            || async {
                let healthy: Option<bool> = None;
                Ok::<bool, ProbeError>(healthy.expect("probe bug"))
            },
        ));

        monitor.run_once().await;
        let report = monitor.status();
        for id in ["hang", "error", "panic"] {
            assert_eq!(report.checks[id].status, HealthStatus::Unhealthy, "{}", id);
        }
        assert_eq!(report.checks["error"].message.as_deref(), Some("db unreachable"));
        assert_eq!(report.overall_status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unregister_and_check_now() {
        let monitor = HealthMonitor::new(Duration::from_secs(1));
        monitor.register(flag_probe("db", Arc::new(AtomicBool::new(false))));

        let result = monitor.check_now("db").await.unwrap();
        assert_eq!(result.consecutive_failures, 1);

        assert!(monitor.unregister("db"));
        assert!(!monitor.unregister("db"));
        assert!(monitor.check_now("db").await.is_none());
        assert!(monitor.status().checks.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let monitor = Arc::new(HealthMonitor::new(Duration::from_millis(10)));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(monitor.clone().run(rx));
        tx.send(()).unwrap();
        time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
