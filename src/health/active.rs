//! Active instance health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered instance that declares a health check or URL
//! - Flip instance status in the registry on state changes only
//! - Deregister instances that stay unhealthy past their window

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use dashmap::DashMap;
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::HealthCheckSettings;
use crate::discovery::{HealthCheckConfig, InstanceStatus, Registry, ServiceInstance};
use crate::observability::metrics;

const USER_AGENT: &str = "service-resilience-health-check";

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    UnexpectedStatus(u16),
    ConnectionError(String),
    TimedOut,
    InvalidRequest(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Healthy => f.write_str("healthy"),
            ProbeOutcome::UnexpectedStatus(code) => write!(f, "unexpected status {}", code),
            ProbeOutcome::ConnectionError(e) => write!(f, "connection error: {}", e),
            ProbeOutcome::TimedOut => f.write_str("timeout"),
            ProbeOutcome::InvalidRequest(e) => write!(f, "invalid request: {}", e),
        }
    }
}

/// Transport used to probe one health check endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, check: &HealthCheckConfig) -> ProbeOutcome;
}

/// HTTP GET probe on the hyper-util legacy client.
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, check: &HealthCheckConfig) -> ProbeOutcome {
        let request = match Request::builder()
            .method("GET")
            .uri(check.url.as_str())
            .header("user-agent", USER_AGENT)
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => return ProbeOutcome::InvalidRequest(e.to_string()),
        };

        match time::timeout(check.timeout(), self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if status == check.expected_status_code {
                    ProbeOutcome::Healthy
                } else {
                    ProbeOutcome::UnexpectedStatus(status)
                }
            }
            Ok(Err(e)) => ProbeOutcome::ConnectionError(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ProbeTracking {
    last_probe: Option<Instant>,
    unhealthy_since: Option<Instant>,
}

/// Background checker driving instance status from probe results.
pub struct HealthChecker {
    registry: Arc<Registry>,
    probe: Arc<dyn Probe>,
    enabled: bool,
    tick: Duration,
    /// Check settings for instances that only declare a URL.
    defaults: HealthCheckSettings,
    tracking: DashMap<String, ProbeTracking>,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, settings: &HealthCheckSettings) -> Self {
        Self {
            registry,
            probe: Arc::new(HttpProbe::new()),
            enabled: settings.enabled,
            tick: settings.tick(),
            defaults: settings.clone(),
            tracking: DashMap::new(),
        }
    }

    /// Replace the transport (tests, non-HTTP probes).
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.enabled {
            tracing::info!("Instance health checks disabled");
            return;
        }

        tracing::info!(tick_ms = self.tick.as_millis() as u64, "Health checker starting");

        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every due instance once. Returns how many were probed.
    pub async fn check_once(&self) -> usize {
        let entries = match self.registry.checked_instances().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Health checker could not list instances");
                return 0;
            }
        };

        let live: HashSet<&str> = entries.iter().map(|e| e.instance.id.as_str()).collect();
        self.tracking.retain(|id, _| live.contains(id.as_str()));

        let now = Instant::now();
        let due: Vec<(ServiceInstance, HealthCheckConfig)> = entries
            .iter()
            .filter(|e| e.instance.status != InstanceStatus::Stopping)
            .filter_map(|e| {
                let check = e.resolved_check(&self.defaults)?;
                self.is_due(&e.instance.id, &check, now)
                    .then(|| (e.instance.clone(), check))
            })
            .collect();

        let outcomes = join_all(due.iter().map(|(_, check)| self.probe.probe(check))).await;

        let probed = due.len();
        for ((instance, check), outcome) in due.into_iter().zip(outcomes) {
            self.apply(instance, &check, outcome).await;
        }
        probed
    }

    fn is_due(&self, instance_id: &str, check: &HealthCheckConfig, now: Instant) -> bool {
        match self.tracking.get(instance_id).and_then(|t| t.last_probe) {
            Some(last) => now.duration_since(last) >= check.interval(),
            None => true,
        }
    }

    async fn apply(&self, probed: ServiceInstance, check: &HealthCheckConfig, outcome: ProbeOutcome) {
        // Status may have changed while the check was in flight
        let instance = match self.registry.instance(&probed.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                self.tracking.remove(&probed.id);
                return;
            }
            Err(e) => {
                tracing::warn!(instance_id = %probed.id, error = %e, "Failed to re-read instance");
                probed
            }
        };
        if instance.status == InstanceStatus::Stopping {
            tracing::debug!(instance_id = %instance.id, "Instance draining, check result ignored");
            return;
        }

        let now = Instant::now();
        let healthy = outcome.is_healthy();

        let unhealthy_since = {
            let mut track = self.tracking.entry(instance.id.clone()).or_default();
            track.last_probe = Some(now);
            if healthy {
                track.unhealthy_since = None;
            } else if track.unhealthy_since.is_none() {
                track.unhealthy_since = Some(now);
            }
            track.unhealthy_since
        };

        metrics::record_instance_health(&instance.name, &instance.id, healthy);

        if healthy {
            if instance.status != InstanceStatus::Healthy {
                if instance.status == InstanceStatus::Unhealthy {
                    tracing::info!(
                        service = %instance.name,
                        instance_id = %instance.id,
                        "Instance recovered"
                    );
                } else {
                    tracing::info!(
                        service = %instance.name,
                        instance_id = %instance.id,
                        from = %instance.status,
                        "Instance became healthy"
                    );
                }
                self.set_status(&instance, InstanceStatus::Healthy).await;
            }
            if let Err(e) = self.registry.heartbeat(&instance.id).await {
                tracing::warn!(instance_id = %instance.id, error = %e, "Failed to record heartbeat");
            }
            return;
        }

        if instance.status != InstanceStatus::Unhealthy {
            tracing::warn!(
                service = %instance.name,
                instance_id = %instance.id,
                url = %check.url,
                reason = %outcome,
                "Health check failed, marking instance unhealthy"
            );
            self.set_status(&instance, InstanceStatus::Unhealthy).await;
        } else {
            tracing::debug!(instance_id = %instance.id, reason = %outcome, "Instance still unhealthy");
        }

        if let (Some(window), Some(since)) = (check.deregister_after(), unhealthy_since) {
            if now.duration_since(since) >= window {
                tracing::warn!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    unhealthy_secs = now.duration_since(since).as_secs(),
                    "Instance unhealthy past deregistration window, deregistering"
                );
                self.tracking.remove(&instance.id);
                if let Err(e) = self.registry.deregister(&instance.id).await {
                    tracing::warn!(instance_id = %instance.id, error = %e, "Failed to deregister instance");
                }
            }
        }
    }

    async fn set_status(&self, instance: &ServiceInstance, status: InstanceStatus) {
        if let Err(e) = self.registry.update_status(&instance.id, status, None).await {
            tracing::warn!(
                instance_id = %instance.id,
                status = %status,
                error = %e,
                "Failed to update instance status"
            );
        }
    }
}
