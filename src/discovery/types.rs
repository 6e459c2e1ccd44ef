//! Registry events and error definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::instance::ServiceInstance;

/// Errors that can occur during registry and discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The instance definition is unusable (empty id, empty name...).
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// The external coordinator rejected or failed a request.
    #[error("Registry backend error: {0}")]
    Backend(String),

    /// HTTP transport to the external coordinator failed.
    #[error("Registry backend unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// No healthy instance could be selected.
    #[error("Service unavailable: no healthy instance of '{0}'")]
    ServiceUnavailable(String),
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Kind of registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Register,
    Deregister,
    Update,
}

/// Notification delivered to watchers after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub instance: ServiceInstance,
}
