//! Discovery façade.
//!
//! # Responsibilities
//! - Own the registry, the instance health checker and the load balancer
//! - Register this process's own instances and remove them on shutdown
//! - Answer "one instance", "all instances" and "healthy instances" queries

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::schema::{BackendKind, DiscoveryConfig, HealthCheckSettings, LoadBalancerConfig};
use crate::discovery::backend::{InMemoryBackend, RegistryBackend};
use crate::discovery::consul::ConsulBackend;
use crate::discovery::instance::{HealthCheckConfig, InstanceStatus, ServiceInstance};
use crate::discovery::registry::Registry;
use crate::discovery::types::{DiscoveryError, DiscoveryResult};
use crate::health::{HealthChecker, Probe};
use crate::load_balancer::{InstanceLease, LoadBalancer};

/// What a process declares about itself when joining the registry.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    /// Absolute URL, or a path (`/health`) resolved against `host:port`.
    pub health_check_url: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl Registration {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    fn resolved_health_url(&self) -> Option<String> {
        let url = self.health_check_url.as_deref()?;
        if url.starts_with('/') {
            Some(format!("http://{}:{}{}", self.host, self.port, url))
        } else {
            Some(url.to_string())
        }
    }
}

pub struct ServiceDiscovery {
    registry: Arc<Registry>,
    checker: Arc<HealthChecker>,
    balancer: Arc<LoadBalancer>,
    defaults: HealthCheckSettings,
    /// Ids registered through `register_self`, removed by `deregister`.
    own_instances: Mutex<Vec<String>>,
}

impl ServiceDiscovery {
    pub fn new(registry: Arc<Registry>, balancer: Arc<LoadBalancer>, defaults: HealthCheckSettings) -> Self {
        let checker = Arc::new(HealthChecker::new(registry.clone(), &defaults));
        Self {
            registry,
            checker,
            balancer,
            defaults,
            own_instances: Mutex::new(Vec::new()),
        }
    }

    /// Build the backend, balancer and checker from configuration.
    pub fn from_config(
        discovery: &DiscoveryConfig,
        health: &HealthCheckSettings,
        balancing: &LoadBalancerConfig,
    ) -> DiscoveryResult<Self> {
        let backend: Arc<dyn RegistryBackend> = match discovery.backend {
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
            BackendKind::Consul => Arc::new(ConsulBackend::new(&discovery.consul)?),
        };

        let balancer = LoadBalancer::new(balancing.strategy);
        for o in &balancing.overrides {
            balancer.set_strategy(&o.service, o.strategy);
        }

        Ok(Self::new(
            Arc::new(Registry::new(backend)),
            Arc::new(balancer),
            health.clone(),
        ))
    }

    /// Replace the health checker's transport.
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.checker = Arc::new(HealthChecker::new(self.registry.clone(), &self.defaults).with_probe(probe));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Spawn the health checker loop.
    pub fn start(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.checker.clone().run(shutdown))
    }

    /// Register an instance of this process. Returns the generated instance id.
    ///
    /// With a health check URL the instance starts `Unknown` until the first probe;
    /// without one it is `Healthy` immediately.
    pub async fn register_self(&self, registration: Registration) -> DiscoveryResult<String> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", registration.service_name, &suffix[..8]);

        let health_url = registration.resolved_health_url();
        let mut instance = ServiceInstance::new(
            &id,
            &registration.service_name,
            &registration.host,
            registration.port,
        )
        .with_tags(registration.tags.iter().cloned());
        instance.metadata = registration.metadata.clone();

        let check = match health_url {
            Some(url) => {
                instance = instance
                    .with_health_check_url(url.clone())
                    .with_status(InstanceStatus::Unknown);
                Some(self.default_check(url))
            }
            None => {
                instance = instance.with_status(InstanceStatus::Healthy);
                None
            }
        };

        self.registry.register(instance, check).await?;
        self.own_instances
            .lock()
            .expect("own instances mutex poisoned")
            .push(id.clone());

        tracing::info!(service = %registration.service_name, instance_id = %id, "Registered self");
        Ok(id)
    }

    /// Deregister every instance added through `register_self`.
    ///
    /// Every id is attempted. Ids the backend failed to remove stay tracked so a
    /// later call can retry them, and the first error is returned.
    pub async fn deregister(&self) -> DiscoveryResult<usize> {
        let ids: Vec<String> = std::mem::take(
            &mut *self.own_instances.lock().expect("own instances mutex poisoned"),
        );

        let mut removed = 0;
        let mut failed = Vec::new();
        let mut first_error = None;
        for id in ids {
            match self.registry.deregister(&id).await {
                Ok(true) => {
                    self.balancer.connections().forget(&id);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "Failed to deregister self");
                    failed.push(id);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !failed.is_empty() {
            self.own_instances
                .lock()
                .expect("own instances mutex poisoned")
                .extend(failed);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// One healthy instance chosen by the service's strategy.
    pub async fn discover_one(&self, service_name: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        let instances = self.registry.discover(service_name).await?;
        Ok(self.balancer.select(service_name, &instances))
    }

    /// Like `discover_one`, but no healthy instance is an error.
    pub async fn require_one(&self, service_name: &str) -> DiscoveryResult<ServiceInstance> {
        self.discover_one(service_name)
            .await?
            .ok_or_else(|| DiscoveryError::ServiceUnavailable(service_name.to_string()))
    }

    /// Select an instance and hold an in-flight slot on it.
    pub async fn acquire(&self, service_name: &str) -> DiscoveryResult<InstanceLease> {
        let instances = self.registry.discover(service_name).await?;
        self.balancer
            .acquire(service_name, &instances)
            .ok_or_else(|| DiscoveryError::ServiceUnavailable(service_name.to_string()))
    }

    /// Every instance regardless of status.
    pub async fn discover_all(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        self.registry.discover(service_name).await
    }

    pub async fn healthy_instances(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        Ok(self
            .registry
            .discover(service_name)
            .await?
            .into_iter()
            .filter(ServiceInstance::is_healthy)
            .collect())
    }

    /// Health check for `url` using the configured defaults.
    pub fn default_check(&self, url: String) -> HealthCheckConfig {
        HealthCheckConfig::from_settings(url, &self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::instance::RegisteredInstance;
    use crate::health::ProbeOutcome;
    use async_trait::async_trait;

    struct AlwaysHealthy;

    #[async_trait]
    impl Probe for AlwaysHealthy {
        async fn probe(&self, _check: &HealthCheckConfig) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }
    }

    fn discovery() -> ServiceDiscovery {
        ServiceDiscovery::new(
            Arc::new(Registry::in_memory()),
            Arc::new(LoadBalancer::default()),
            HealthCheckSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_register_self_without_check_is_healthy() {
        let sd = discovery();
        let id = sd
            .register_self(Registration::new("auth-service", "10.0.0.5", 8080).with_tags(["v1"]))
            .await
            .unwrap();

        assert!(id.starts_with("auth-service-"));
        assert_eq!(id.len(), "auth-service-".len() + 8);

        let found = sd.discover_one("auth-service").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.tags.contains("v1"));
    }

    #[tokio::test]
    async fn test_register_self_with_check_waits_for_probe() {
        let sd = discovery().with_probe(Arc::new(AlwaysHealthy));
        sd.register_self(
            Registration::new("docs", "127.0.0.1", 9100).with_health_check_url("/health"),
        )
        .await
        .unwrap();

        let all = sd.discover_all("docs").await.unwrap();
        assert_eq!(all[0].status, InstanceStatus::Unknown);
        assert_eq!(all[0].health_check_url.as_deref(), Some("http://127.0.0.1:9100/health"));
        assert!(sd.discover_one("docs").await.unwrap().is_none());
        assert!(matches!(
            sd.require_one("docs").await,
            Err(DiscoveryError::ServiceUnavailable(_))
        ));

        sd.checker().check_once().await;
        assert_eq!(sd.healthy_instances("docs").await.unwrap().len(), 1);
        assert!(sd.require_one("docs").await.is_ok());
    }

    #[tokio::test]
    async fn test_deregister_removes_own_instances_only() {
        let sd = discovery();
        sd.register_self(Registration::new("kg", "127.0.0.1", 1)).await.unwrap();
        sd.register_self(Registration::new("kg", "127.0.0.1", 2)).await.unwrap();
        sd.registry()
            .register(
                ServiceInstance::new("foreign", "kg", "10.0.0.9", 3).with_status(InstanceStatus::Healthy),
                None,
            )
            .await
            .unwrap();

        assert_eq!(sd.deregister().await.unwrap(), 2);
        let remaining = sd.discover_all("kg").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "foreign");
        assert_eq!(sd.deregister().await.unwrap(), 0);
    }

    /// In-memory storage whose deregister fails for instances on one port.
    #[derive(Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        failing_port: std::sync::atomic::AtomicU16,
    }

    #[async_trait]
    impl RegistryBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn register(&self, entry: RegisteredInstance) -> DiscoveryResult<Option<ServiceInstance>> {
            self.inner.register(entry).await
        }

        async fn deregister(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
            let port = self.failing_port.load(std::sync::atomic::Ordering::SeqCst);
            if let Some(instance) = self.inner.instance(instance_id).await? {
                if instance.port == port {
                    return Err(DiscoveryError::Backend("agent unavailable".into()));
                }
            }
            self.inner.deregister(instance_id).await
        }

        async fn instance(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
            self.inner.instance(instance_id).await
        }

        async fn instances(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
            self.inner.instances(service_name).await
        }

        async fn update_status(
            &self,
            instance_id: &str,
            status: InstanceStatus,
            metadata_patch: Option<BTreeMap<String, String>>,
        ) -> DiscoveryResult<Option<ServiceInstance>> {
            self.inner.update_status(instance_id, status, metadata_patch).await
        }

        async fn heartbeat(&self, instance_id: &str) -> DiscoveryResult<bool> {
            self.inner.heartbeat(instance_id).await
        }

        async fn all_services(&self) -> DiscoveryResult<std::collections::HashMap<String, Vec<ServiceInstance>>> {
            self.inner.all_services().await
        }

        async fn checked_instances(&self) -> DiscoveryResult<Vec<RegisteredInstance>> {
            self.inner.checked_instances().await
        }
    }

    #[tokio::test]
    async fn test_failed_deregister_keeps_ids_for_retry() {
        let backend = Arc::new(FlakyBackend::default());
        let sd = ServiceDiscovery::new(
            Arc::new(Registry::new(backend.clone())),
            Arc::new(LoadBalancer::default()),
            HealthCheckSettings::default(),
        );
        sd.register_self(Registration::new("kg", "127.0.0.1", 1)).await.unwrap();
        sd.register_self(Registration::new("kg", "127.0.0.1", 2)).await.unwrap();
        sd.register_self(Registration::new("kg", "127.0.0.1", 3)).await.unwrap();

        backend.failing_port.store(2, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(sd.deregister().await, Err(DiscoveryError::Backend(_))));

        // Instances on either side of the failure were still removed
        let remaining = sd.discover_all("kg").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].port, 2);

        backend.failing_port.store(0, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(sd.deregister().await.unwrap(), 1);
        assert!(sd.discover_all("kg").await.unwrap().is_empty());
        assert_eq!(sd.deregister().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acquire_unavailable() {
        let sd = discovery();
        assert!(matches!(
            sd.acquire("missing").await,
            Err(DiscoveryError::ServiceUnavailable(_))
        ));

        sd.register_self(Registration::new("cache", "127.0.0.1", 6379)).await.unwrap();
        let lease = sd.acquire("cache").await.unwrap();
        assert_eq!(sd.balancer().connections().in_flight(&lease.id), 1);
    }
}
