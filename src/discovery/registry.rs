//! Service registry with change notification.
//!
//! # Responsibilities
//! - Validate and store instances through a pluggable backend
//! - Notify watchers (callbacks and broadcast subscribers) after every mutation
//! - Expose pull-style discovery by logical service name

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::discovery::backend::{InMemoryBackend, RegistryBackend};
use crate::discovery::instance::{HealthCheckConfig, InstanceStatus, RegisteredInstance, ServiceInstance};
use crate::discovery::types::{DiscoveryError, DiscoveryResult, EventKind, RegistryEvent};
use crate::observability::metrics;

/// Error a watcher may return; it is logged and otherwise ignored.
pub type WatcherError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked after every registry mutation.
pub type WatchCallback = Arc<dyn Fn(&RegistryEvent) -> Result<(), WatcherError> + Send + Sync>;

/// Handle returned by [`Registry::watch`], used to remove the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Stores instances per logical service name.
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    watchers: RwLock<Vec<(WatcherId, WatchCallback)>>,
    next_watcher: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Create a registry over the given backend.
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tracing::info!(backend = backend.name(), "Service registry initialized");
        Self {
            backend,
            watchers: RwLock::new(Vec::new()),
            next_watcher: AtomicU64::new(1),
            events,
        }
    }

    /// Registry over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Register (or replace) an instance.
    ///
    /// Returns `true` when the id was new, `false` when an existing entry was replaced.
    pub async fn register(
        &self,
        instance: ServiceInstance,
        health_check: Option<HealthCheckConfig>,
    ) -> DiscoveryResult<bool> {
        validate(&instance)?;

        let entry = RegisteredInstance {
            instance: instance.clone(),
            health_check,
        };
        let previous = self.backend.register(entry).await?;

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            address = %instance.address(),
            replaced = previous.is_some(),
            "Instance registered"
        );
        metrics::record_instance_health(&instance.name, &instance.id, instance.is_healthy());
        self.notify(RegistryEvent {
            kind: EventKind::Register,
            instance,
        });
        Ok(previous.is_none())
    }

    /// Remove an instance. Returns `false` if the id is unknown.
    pub async fn deregister(&self, instance_id: &str) -> DiscoveryResult<bool> {
        match self.backend.deregister(instance_id).await? {
            Some(instance) => {
                tracing::info!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    "Instance deregistered"
                );
                self.notify(RegistryEvent {
                    kind: EventKind::Deregister,
                    instance,
                });
                Ok(true)
            }
            None => {
                tracing::debug!(instance_id = %instance_id, "Deregister of unknown instance");
                Ok(false)
            }
        }
    }

    /// Current state of one instance.
    pub async fn instance(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        self.backend.instance(instance_id).await
    }

    /// Instances of a logical service. Unknown names yield an empty list.
    pub async fn discover(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        self.backend.instances(service_name).await
    }

    /// Administrative or health-driven status change. Returns `false` if the id is unknown.
    pub async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        metadata_patch: Option<BTreeMap<String, String>>,
    ) -> DiscoveryResult<bool> {
        match self
            .backend
            .update_status(instance_id, status, metadata_patch)
            .await?
        {
            Some(instance) => {
                tracing::debug!(
                    service = %instance.name,
                    instance_id = %instance.id,
                    status = %status,
                    "Instance status updated"
                );
                metrics::record_instance_health(&instance.name, &instance.id, instance.is_healthy());
                self.notify(RegistryEvent {
                    kind: EventKind::Update,
                    instance,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh an instance's heartbeat timestamp. Not a watched mutation.
    pub async fn heartbeat(&self, instance_id: &str) -> DiscoveryResult<bool> {
        self.backend.heartbeat(instance_id).await
    }

    /// Every registered service with its instances.
    pub async fn all_services(&self) -> DiscoveryResult<HashMap<String, Vec<ServiceInstance>>> {
        self.backend.all_services().await
    }

    /// Entries that carry a health check definition or a health check URL.
    pub async fn checked_instances(&self) -> DiscoveryResult<Vec<RegisteredInstance>> {
        self.backend.checked_instances().await
    }

    /// Add a callback watcher.
    pub fn watch<F>(&self, callback: F) -> WatcherId
    where
        F: Fn(&RegistryEvent) -> Result<(), WatcherError> + Send + Sync + 'static,
    {
        let id = WatcherId(self.next_watcher.fetch_add(1, Ordering::Relaxed));
        self.watchers
            .write()
            .expect("registry watcher lock poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback watcher. Returns `false` if it was not registered.
    pub fn unwatch(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.write().expect("registry watcher lock poisoned");
        let before = watchers.len();
        watchers.retain(|(wid, _)| *wid != id);
        watchers.len() != before
    }

    /// Subscribe to the event stream (push discovery).
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // Callbacks run outside the lock so a watcher may itself call `watch`
        let watchers: Vec<WatchCallback> = self
            .watchers
            .read()
            .expect("registry watcher lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in watchers {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        instance_id = %event.instance.id,
                        kind = ?event.kind,
                        error = %e,
                        "Registry watcher failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        instance_id = %event.instance.id,
                        kind = ?event.kind,
                        "Registry watcher panicked"
                    );
                }
            }
        }

        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn validate(instance: &ServiceInstance) -> DiscoveryResult<()> {
    if instance.id.trim().is_empty() {
        return Err(DiscoveryError::InvalidInstance("empty instance id".into()));
    }
    if instance.name.trim().is_empty() {
        return Err(DiscoveryError::InvalidInstance(format!(
            "instance '{}' has no service name",
            instance.id
        )));
    }
    if instance.host.trim().is_empty() {
        return Err(DiscoveryError::InvalidInstance(format!(
            "instance '{}' has no host",
            instance.id
        )));
    }
    Ok(())
}
