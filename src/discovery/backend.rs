//! Registry storage backends.
//!
//! # Responsibilities
//! - Define the storage contract behind the registry
//! - Provide the process-local in-memory implementation
//!
//! # Design Decisions
//! - Storage is partitioned by service name so writers of different services never contend
//! - Instances keep registration order within a service (stable load-balancer ordering)
//! - Upsert semantics: re-registering an id replaces the stored entry

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::discovery::instance::{unix_millis, InstanceStatus, RegisteredInstance, ServiceInstance};
use crate::discovery::types::DiscoveryResult;

/// Storage contract for service instances.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    /// Insert or replace an entry. Returns the entry it replaced.
    async fn register(&self, entry: RegisteredInstance) -> DiscoveryResult<Option<ServiceInstance>>;

    /// Remove an instance by id. Returns the removed instance.
    async fn deregister(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>>;

    /// One instance by id.
    async fn instance(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>>;

    /// Instances of one logical service, in registration order.
    async fn instances(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>>;

    /// Set status and merge a metadata patch. Returns the updated instance.
    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        metadata_patch: Option<BTreeMap<String, String>>,
    ) -> DiscoveryResult<Option<ServiceInstance>>;

    /// Refresh `last_heartbeat`. Returns false for unknown ids.
    async fn heartbeat(&self, instance_id: &str) -> DiscoveryResult<bool>;

    /// Every service with its instances.
    async fn all_services(&self) -> DiscoveryResult<HashMap<String, Vec<ServiceInstance>>>;

    /// Entries that carry a health check definition or a health check URL.
    async fn checked_instances(&self) -> DiscoveryResult<Vec<RegisteredInstance>>;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    /// service name -> entries in registration order.
    services: DashMap<String, Vec<RegisteredInstance>>,
    /// instance id -> service name.
    index: DashMap<String, String>,
    /// Held by register/deregister so `index` and `services` change together.
    membership: Mutex<()>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_from_service(&self, service: &str, instance_id: &str) -> Option<ServiceInstance> {
        let removed = {
            let mut group = self.services.get_mut(service)?;
            let pos = group.iter().position(|e| e.instance.id == instance_id)?;
            group.remove(pos).instance
        };
        self.services.remove_if(service, |_, group| group.is_empty());
        Some(removed)
    }

    fn modify<F>(&self, instance_id: &str, f: F) -> Option<ServiceInstance>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let service = self.index.get(instance_id)?.value().clone();
        let mut group = self.services.get_mut(&service)?;
        let entry = group.iter_mut().find(|e| e.instance.id == instance_id)?;
        f(&mut entry.instance);
        Some(entry.instance.clone())
    }
}

#[async_trait]
impl RegistryBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, entry: RegisteredInstance) -> DiscoveryResult<Option<ServiceInstance>> {
        let id = entry.instance.id.clone();
        let service = entry.instance.name.clone();
        let _membership = self.membership.lock().expect("membership mutex poisoned");

        // An id moving to another service leaves its old group
        let mut replaced = None;
        if let Some(old_service) = self.index.insert(id.clone(), service.clone()) {
            if old_service != service {
                replaced = self.remove_from_service(&old_service, &id);
            }
        }

        let mut group = self.services.entry(service).or_default();
        match group.iter_mut().find(|e| e.instance.id == id) {
            Some(existing) => {
                let previous = std::mem::replace(existing, entry);
                Ok(Some(previous.instance))
            }
            None => {
                group.push(entry);
                Ok(replaced)
            }
        }
    }

    async fn deregister(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        let _membership = self.membership.lock().expect("membership mutex poisoned");
        let Some((_, service)) = self.index.remove(instance_id) else {
            return Ok(None);
        };
        Ok(self.remove_from_service(&service, instance_id))
    }

    async fn instance(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        let Some(service) = self.index.get(instance_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        Ok(self.services.get(&service).and_then(|group| {
            group
                .iter()
                .find(|e| e.instance.id == instance_id)
                .map(|e| e.instance.clone())
        }))
    }

    async fn instances(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(service_name)
            .map(|group| group.iter().map(|e| e.instance.clone()).collect())
            .unwrap_or_default())
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        metadata_patch: Option<BTreeMap<String, String>>,
    ) -> DiscoveryResult<Option<ServiceInstance>> {
        Ok(self.modify(instance_id, |inst| {
            inst.status = status;
            if let Some(patch) = metadata_patch {
                inst.metadata.extend(patch);
            }
        }))
    }

    async fn heartbeat(&self, instance_id: &str) -> DiscoveryResult<bool> {
        Ok(self
            .modify(instance_id, |inst| inst.last_heartbeat = unix_millis())
            .is_some())
    }

    async fn all_services(&self) -> DiscoveryResult<HashMap<String, Vec<ServiceInstance>>> {
        Ok(self
            .services
            .iter()
            .map(|r| {
                let instances = r.value().iter().map(|e| e.instance.clone()).collect();
                (r.key().clone(), instances)
            })
            .collect())
    }

    async fn checked_instances(&self) -> DiscoveryResult<Vec<RegisteredInstance>> {
        Ok(self
            .services
            .iter()
            .flat_map(|r| {
                r.value()
                    .iter()
                    .filter(|e| e.is_checked())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}
