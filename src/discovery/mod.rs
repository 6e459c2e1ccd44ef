//! Service registry and discovery subsystem.
//!
//! # Data Flow
//! ```text
//! Service process starts
//!     → ServiceDiscovery::register_self (service.rs)
//!     → Registry::register (registry.rs): validate, store, notify watchers
//!     → RegistryBackend (backend.rs in-memory, or consul.rs)
//!
//! Caller needs a dependency
//!     → ServiceDiscovery::discover_one
//!     → Registry::discover → LoadBalancer::select (healthy only)
//!     → instance, or ServiceUnavailable
//!
//! Health checker (health::active)
//!     → Registry::update_status / heartbeat / deregister
//! ```
//!
//! # Design Decisions
//! - Re-registering an id is an upsert, never an error
//! - Unknown service names discover as an empty list
//! - Watcher failures are logged and contained; the mutation still succeeds
//! - Storage is behind a trait so an external coordinator can replace the map

pub mod backend;
pub mod consul;
pub mod instance;
pub mod registry;
pub mod service;
pub mod types;

pub use backend::{InMemoryBackend, RegistryBackend};
pub use consul::ConsulBackend;
pub use instance::{unix_millis, HealthCheckConfig, InstanceStatus, RegisteredInstance, ServiceInstance};
pub use registry::{Registry, WatcherId};
pub use service::{Registration, ServiceDiscovery};
pub use types::{DiscoveryError, DiscoveryResult, EventKind, RegistryEvent};
