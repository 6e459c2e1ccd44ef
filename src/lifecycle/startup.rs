//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build discovery and fault tolerance in dependency order
//! - Start background tasks (instance health checks, health monitor)
//! - Tear everything down in reverse on shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The context is passed by reference to whoever needs it; nothing is global

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::loader::ConfigError;
use crate::config::schema::ResilienceConfig;
use crate::config::validation::validate_config;
use crate::discovery::{DiscoveryError, ServiceDiscovery, ServiceInstance};
use crate::lifecycle::shutdown::Shutdown;
use crate::resilience::{ExecuteOptions, FaultToleranceManager, ResilienceError};

/// Background loops get this long to exit after the signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery backend error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a process needs to discover and call its dependencies.
pub struct ResilienceContext {
    config: ResilienceConfig,
    discovery: Arc<ServiceDiscovery>,
    fault_tolerance: Arc<FaultToleranceManager>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResilienceContext {
    pub fn from_config(config: ResilienceConfig) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let discovery = ServiceDiscovery::from_config(
            &config.discovery,
            &config.health_check,
            &config.load_balancer,
        )?;
        let fault_tolerance = FaultToleranceManager::from_config(&config);

        tracing::info!(
            backend = ?config.discovery.backend,
            services = config.services.len(),
            bulkheads = config.bulkheads.len(),
            "Resilience context built"
        );

        Ok(Self::with_parts(config, Arc::new(discovery), Arc::new(fault_tolerance)))
    }

    /// Assemble a context from pre-built components.
    pub fn with_parts(
        config: ResilienceConfig,
        discovery: Arc<ServiceDiscovery>,
        fault_tolerance: Arc<FaultToleranceManager>,
    ) -> Self {
        Self {
            config,
            discovery,
            fault_tolerance,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn fault_tolerance(&self) -> &Arc<FaultToleranceManager> {
        &self.fault_tolerance
    }

    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Spawn the enabled background loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("task list mutex poisoned");

        if self.config.health_check.enabled {
            tasks.push(self.discovery.start(self.shutdown.subscribe()));
        }
        if self.config.health_monitor.enabled {
            tasks.push(self.fault_tolerance.start_monitoring(self.shutdown.subscribe()));
        }

        tracing::info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Track an extra task that exits on the shutdown signal.
    pub fn spawn_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task list mutex poisoned").push(task);
    }

    /// Call `service` through discovery and the configured fault tolerance.
    ///
    /// Each attempt selects an instance and holds an in-flight slot on it, so a
    /// retry may land on a different instance.
    pub async fn call<T, E, F, Fut>(
        &self,
        service: &str,
        options: ExecuteOptions,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: 'static,
        E: Display + 'static,
        F: Fn(ServiceInstance) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let discovery = &self.discovery;
        let op = &op;
        self.fault_tolerance
            .execute_lifted(service, options, move || async move {
                let lease = match discovery.acquire(service).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        tracing::warn!(service = %service, error = %e, "No instance available");
                        return Err(ResilienceError::ServiceUnavailable(service.to_string()));
                    }
                };
                op(lease.instance.clone()).await.map_err(ResilienceError::Inner)
            })
            .await
    }

    /// Stop the loops, wait for them, and deregister this process's instances.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned"));
        let count = tasks.len();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(
                tasks = count,
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Background tasks did not stop in time"
            );
        }

        match self.discovery.deregister().await {
            Ok(removed) => tracing::info!(removed, "Own instances deregistered"),
            Err(e) => tracing::error!(error = %e, "Failed to deregister own instances"),
        }
        tracing::info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::HealthCheckSettings;
    use crate::discovery::{InstanceStatus, Registration};
    use crate::resilience::RetryPolicy;

    fn context() -> ResilienceContext {
        let mut config = ResilienceConfig::default();
        config.health_check = HealthCheckSettings {
            tick_ms: 10,
            ..Default::default()
        };
        config.health_monitor.tick_ms = 10;
        ResilienceContext::from_config(config).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ResilienceConfig::default();
        config.retries.max_attempts = 0;
        assert!(matches!(
            ResilienceContext::from_config(config),
            Err(StartupError::Config(ConfigError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_deregisters() {
        let ctx = context();
        ctx.discovery()
            .register_self(Registration::new("rag-service", "127.0.0.1", 8000))
            .await
            .unwrap();

        ctx.start();
        assert_eq!(ctx.shutdown_signal().receiver_count(), 2);

        ctx.shutdown().await;
        assert_eq!(ctx.shutdown_signal().receiver_count(), 0);
        assert!(ctx.discovery().discover_all("rag-service").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_selects_instance_per_attempt() {
        let ctx = context();
        for (id, port) in [("kg-1", 7001), ("kg-2", 7002)] {
            ctx.discovery()
                .registry()
                .register(
                    ServiceInstance::new(id, "kg", "10.0.0.1", port).with_status(InstanceStatus::Healthy),
                    None,
                )
                .await
                .unwrap();
        }

        let seen = Mutex::new(Vec::new());
        let options = ExecuteOptions::new().with_retry(RetryPolicy::new(2).with_jitter(false));
        let result = ctx
            .call("kg", options, |instance| {
                seen.lock().unwrap().push(instance.id.clone());
                let first = seen.lock().unwrap().len() == 1;
                async move {
                    if first {
                        Err("connection reset".to_string())
                    } else {
                        Ok(instance.port)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7002);
        assert_eq!(*seen.lock().unwrap(), vec!["kg-1".to_string(), "kg-2".to_string()]);
    }

    #[tokio::test]
    async fn test_call_without_instances_is_unavailable() {
        let ctx = context();
        ctx.fault_tolerance().configure_service("ghost", []);
        let err = ctx
            .call("ghost", ExecuteOptions::new(), |_| async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::ServiceUnavailable(ref s) if s == "ghost"));
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
