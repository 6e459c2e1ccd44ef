//! Consul-backed registry storage.
//!
//! # Responsibilities
//! - Register/deregister instances with the local Consul agent
//! - Read instances (with aggregated check status) from the health endpoint
//! - Forward health check definitions in Consul's own format
//!
//! # Design Decisions
//! - Consul runs its own checks; the reported check status maps onto `InstanceStatus`
//! - Administrative Unhealthy/Stopping updates toggle agent maintenance mode
//! - Entries registered through this process are mirrored locally so the health
//!   checker can see their definitions without an extra round trip

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::config::schema::ConsulConfig;
use crate::discovery::backend::RegistryBackend;
use crate::discovery::instance::{unix_millis, InstanceStatus, RegisteredInstance, ServiceInstance};
use crate::discovery::types::{DiscoveryError, DiscoveryResult};

/// Service registration payload (`PUT /v1/agent/service/register`).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    address: String,
    port: u16,
    tags: Vec<String>,
    meta: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
}

/// One entry of `GET /v1/health/service/{name}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: CatalogService,
    #[serde(default)]
    checks: Vec<CheckStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckStatus {
    status: String,
}

/// Registry backend talking to a Consul agent.
pub struct ConsulBackend {
    client: Client,
    base_url: url::Url,
    token: Option<String>,
    /// Entries registered through this backend.
    local: DashMap<String, RegisteredInstance>,
}

impl ConsulBackend {
    /// Create a new backend from configuration.
    pub fn new(config: &ConsulConfig) -> DiscoveryResult<Self> {
        let base = url::Url::parse(&config.address).map_err(|e| {
            DiscoveryError::Backend(format!("Invalid Consul address '{}': {}", config.address, e))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base,
            token: config.token.clone(),
            local: DashMap::new(),
        })
    }

    /// Endpoint URL with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.endpoint(segments));
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> DiscoveryResult<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Backend(format!("Consul returned {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn set_maintenance(&self, instance_id: &str, enable: bool) -> DiscoveryResult<()> {
        let request = self
            .request(
                reqwest::Method::PUT,
                &["v1", "agent", "service", "maintenance", instance_id],
            )
            .query(&[("enable", enable)]);
        self.send(request).await?;
        Ok(())
    }

    fn registration(entry: &RegisteredInstance) -> AgentServiceRegistration {
        let inst = &entry.instance;
        let mut meta = inst.metadata.clone();
        if !inst.version.is_empty() {
            meta.insert("version".to_string(), inst.version.clone());
        }
        meta.insert("weight".to_string(), inst.weight.to_string());

        AgentServiceRegistration {
            id: inst.id.clone(),
            name: inst.name.clone(),
            address: inst.host.clone(),
            port: inst.port,
            tags: inst.tags.iter().cloned().collect(),
            meta,
            check: entry.health_check.as_ref().map(|hc| AgentCheck {
                http: hc.url.clone(),
                interval: format!("{}s", hc.interval_secs),
                timeout: format!("{}s", hc.timeout_secs),
                deregister_critical_service_after: hc
                    .deregister_after()
                    .map(|d| format!("{}s", d.as_secs())),
            }),
        }
    }

    fn to_instance(&self, entry: HealthEntry) -> ServiceInstance {
        let status = aggregate_status(&entry.checks);
        let svc = entry.service;
        let mut meta = svc.meta.unwrap_or_default();
        let version = meta.remove("version").unwrap_or_default();
        let weight = meta
            .remove("weight")
            .and_then(|w| w.parse().ok())
            .unwrap_or(1);

        // Locally registered instances keep their timestamps and check URL
        let local = self.local.get(&svc.id).map(|r| r.instance.clone());
        let now = unix_millis();
        ServiceInstance {
            id: svc.id,
            name: svc.service,
            host: svc.address,
            port: svc.port,
            status,
            tags: svc.tags.unwrap_or_default().into_iter().collect::<BTreeSet<_>>(),
            metadata: meta,
            health_check_url: local.as_ref().and_then(|l| l.health_check_url.clone()),
            registered_at: local.as_ref().map(|l| l.registered_at).unwrap_or(now),
            last_heartbeat: local.as_ref().map(|l| l.last_heartbeat).unwrap_or(now),
            version,
            weight,
        }
    }
}

/// Worst check status wins.
fn aggregate_status(checks: &[CheckStatus]) -> InstanceStatus {
    if checks.is_empty() {
        return InstanceStatus::Unknown;
    }
    if checks
        .iter()
        .any(|c| c.status == "critical" || c.status == "warning")
    {
        InstanceStatus::Unhealthy
    } else if checks.iter().all(|c| c.status == "passing") {
        InstanceStatus::Healthy
    } else {
        InstanceStatus::Unknown
    }
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register(&self, entry: RegisteredInstance) -> DiscoveryResult<Option<ServiceInstance>> {
        let body = Self::registration(&entry);
        self.send(
            self.request(reqwest::Method::PUT, &["v1", "agent", "service", "register"])
                .json(&body),
        )
        .await?;

        let previous = self.local.insert(entry.instance.id.clone(), entry);
        Ok(previous.map(|e| e.instance))
    }

    async fn deregister(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &["v1", "agent", "service", "deregister", instance_id],
            )
            .send()
            .await?;

        // The mirror only drops entries the agent no longer holds
        let status = response.status();
        if status != reqwest::StatusCode::NOT_FOUND && !status.is_success() {
            return Err(DiscoveryError::Backend(format!(
                "Consul deregister returned {}",
                status
            )));
        }
        let removed = self.local.remove(instance_id).map(|(_, e)| e.instance);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(removed);
        }
        // Registered by another agent client; only the id is known
        Ok(removed.or_else(|| Some(ServiceInstance::new(instance_id, "", "", 0))))
    }

    async fn instances(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let entries: Vec<HealthEntry> = self
            .send(self.request(reqwest::Method::GET, &["v1", "health", "service", service_name]))
            .await?
            .json()
            .await?;

        Ok(entries.into_iter().map(|e| self.to_instance(e)).collect())
    }

    async fn instance(&self, instance_id: &str) -> DiscoveryResult<Option<ServiceInstance>> {
        Ok(self.local.get(instance_id).map(|r| r.instance.clone()))
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        metadata_patch: Option<BTreeMap<String, String>>,
    ) -> DiscoveryResult<Option<ServiceInstance>> {
        let Some(mut entry) = self.local.get(instance_id).map(|r| r.clone()) else {
            return Ok(None);
        };

        match status {
            InstanceStatus::Unhealthy | InstanceStatus::Stopping => {
                self.set_maintenance(instance_id, true).await?
            }
            InstanceStatus::Healthy => self.set_maintenance(instance_id, false).await?,
            InstanceStatus::Starting | InstanceStatus::Unknown => {}
        }

        entry.instance.status = status;
        if let Some(patch) = metadata_patch {
            entry.instance.metadata.extend(patch);
            // Metadata only changes through re-registration
            let body = Self::registration(&entry);
            self.send(
                self.request(reqwest::Method::PUT, &["v1", "agent", "service", "register"])
                    .json(&body),
            )
            .await?;
        }

        let updated = entry.instance.clone();
        self.local.insert(instance_id.to_string(), entry);
        Ok(Some(updated))
    }

    async fn heartbeat(&self, instance_id: &str) -> DiscoveryResult<bool> {
        match self.local.get_mut(instance_id) {
            Some(mut entry) => {
                entry.instance.last_heartbeat = unix_millis();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn all_services(&self) -> DiscoveryResult<HashMap<String, Vec<ServiceInstance>>> {
        let catalog: HashMap<String, Vec<String>> = self
            .send(self.request(reqwest::Method::GET, &["v1", "catalog", "services"]))
            .await?
            .json()
            .await?;

        let mut services = HashMap::new();
        for name in catalog.into_keys() {
            // Consul lists itself in the catalog
            if name == "consul" {
                continue;
            }
            let instances = self.instances(&name).await?;
            services.insert(name, instances);
        }
        Ok(services)
    }

    async fn checked_instances(&self) -> DiscoveryResult<Vec<RegisteredInstance>> {
        Ok(self
            .local
            .iter()
            .filter(|r| r.value().is_checked())
            .map(|r| r.value().clone())
            .collect())
    }
}
