//! Service instance data model.
//!
//! # Responsibilities
//! - Represent one network-addressable process of a logical service
//! - Carry the health check definition attached at registration
//! - Track lifecycle status (Starting → Healthy/Unhealthy → Stopping)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::schema::HealthCheckSettings;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Availability of an instance as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
    #[default]
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single instance of a logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique within a registry.
    pub id: String,
    /// Logical service name (e.g., "auth-service").
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Endpoint probed by the health checker.
    pub health_check_url: Option<String>,
    /// Registration time (ms since epoch).
    pub registered_at: u64,
    /// Last successful probe or explicit heartbeat (ms since epoch).
    pub last_heartbeat: u64,
    #[serde(default)]
    pub version: String,
    /// Relative weight for weighted load balancing; 0 excludes the instance.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    /// Create an instance in `Unknown` status.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let now = unix_millis();
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port,
            status: InstanceStatus::Unknown,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            health_check_url: None,
            registered_at: now,
            last_heartbeat: now,
            version: String::new(),
            weight: default_weight(),
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
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

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// `host:port` form used for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }
}

/// Health check definition attached to an instance at registration.
///
/// Immutable for the lifetime of the registration; re-registering replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub url: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Instance is dropped after staying unhealthy this long; 0 disables removal.
    pub deregister_after_secs: u64,
    pub expected_status_code: u16,
}

impl HealthCheckConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval_secs: 10,
            timeout_secs: 5,
            deregister_after_secs: 60,
            expected_status_code: 200,
        }
    }

    /// Check for `url` using the configured defaults.
    pub fn from_settings(url: impl Into<String>, settings: &HealthCheckSettings) -> Self {
        Self::new(url)
            .with_interval_secs(settings.interval_secs)
            .with_timeout_secs(settings.timeout_secs)
            .with_deregister_after_secs(settings.deregister_after_secs)
            .with_expected_status(settings.expected_status)
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_deregister_after_secs(mut self, secs: u64) -> Self {
        self.deregister_after_secs = secs;
        self
    }

    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status_code = status;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `None` when automatic deregistration is disabled.
    pub fn deregister_after(&self) -> Option<Duration> {
        (self.deregister_after_secs > 0).then(|| Duration::from_secs(self.deregister_after_secs))
    }
}

/// Registry entry: the instance plus its optional health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredInstance {
    pub instance: ServiceInstance,
    pub health_check: Option<HealthCheckConfig>,
}

impl RegisteredInstance {
    /// Whether the health checker should probe this entry.
    pub fn is_checked(&self) -> bool {
        self.health_check.is_some() || self.instance.health_check_url.is_some()
    }

    /// The explicit check, else one built from the instance's URL and `defaults`.
    pub fn resolved_check(&self, defaults: &HealthCheckSettings) -> Option<HealthCheckConfig> {
        match (&self.health_check, &self.instance.health_check_url) {
            (Some(check), _) => Some(check.clone()),
            (None, Some(url)) => Some(HealthCheckConfig::from_settings(url.clone(), defaults)),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let inst = ServiceInstance::new("i1", "auth-service", "10.0.0.1", 8080)
            .with_tags(["grpc", "v2"])
            .with_metadata("zone", "a");

        assert_eq!(inst.status, InstanceStatus::Unknown);
        assert_eq!(inst.weight, 1);
        assert_eq!(inst.address(), "10.0.0.1:8080");
        assert!(inst.tags.contains("grpc"));
        assert!(!inst.is_healthy());
    }

    #[test]
    fn test_deregister_window_disabled_at_zero() {
        let check = HealthCheckConfig::new("http://10.0.0.1/health").with_deregister_after_secs(0);
        assert!(check.deregister_after().is_none());
        assert_eq!(check.expected_status_code, 200);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&InstanceStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }
}
