//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Caller wants an instance of a service
//!     → discovery (instances from the registry)
//!     → LoadBalancer filters to Healthy
//!     → Apply the service's strategy:
//!         - round_robin.rs (per-service monotonic counter)
//!         - random.rs (uniform)
//!         - least_conn.rs (fewest tracked connections)
//!         - weighted.rs (cumulative weight)
//!     → connections.rs (optional in-flight guard)
//!     → Return instance or None (service unavailable)
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless apart from round-robin counters
//! - Strategy selection per call or per service, default from config
//! - Unhealthy instances excluded before the strategy runs
//! - An empty healthy set is reported, never retried here

pub mod connections;
pub mod least_conn;
pub mod random;
pub mod round_robin;
pub mod weighted;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use crate::discovery::ServiceInstance;
use connections::{ConnectionGuard, ConnectionTracker};
use least_conn::LeastConnections;
use random::RandomSelect;
use round_robin::RoundRobin;
use weighted::Weighted;

/// Picks one instance from an already-filtered healthy set.
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, service: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;
}

/// Named load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastConnections => "least_connections",
            Strategy::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_connections" => Ok(Strategy::LeastConnections),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(format!("unknown load balancing strategy '{}'", other)),
        }
    }
}

/// A selected instance plus its in-flight guard.
#[derive(Debug)]
pub struct InstanceLease {
    pub instance: ServiceInstance,
    _guard: ConnectionGuard,
}

impl Deref for InstanceLease {
    type Target = ServiceInstance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

/// Selects instances per call using per-service strategies.
pub struct LoadBalancer {
    default_strategy: Strategy,
    overrides: DashMap<String, Strategy>,
    round_robin: RoundRobin,
    random: RandomSelect,
    least_connections: LeastConnections,
    weighted: Weighted,
    connections: Arc<ConnectionTracker>,
}

impl LoadBalancer {
    pub fn new(default_strategy: Strategy) -> Self {
        let connections = Arc::new(ConnectionTracker::new());
        Self {
            default_strategy,
            overrides: DashMap::new(),
            round_robin: RoundRobin::new(),
            random: RandomSelect::new(),
            least_connections: LeastConnections::new(connections.clone()),
            weighted: Weighted::new(),
            connections,
        }
    }

    /// Pin a strategy for one service.
    pub fn set_strategy(&self, service: &str, strategy: Strategy) {
        self.overrides.insert(service.to_string(), strategy);
    }

    pub fn strategy_for(&self, service: &str) -> Strategy {
        self.overrides
            .get(service)
            .map(|s| *s)
            .unwrap_or(self.default_strategy)
    }

    /// Select with the service's configured strategy.
    pub fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        self.select_with(service, instances, self.strategy_for(service))
    }

    /// Select with an explicit strategy for this call.
    pub fn select_with(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        strategy: Strategy,
    ) -> Option<ServiceInstance> {
        let healthy: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect();

        if healthy.is_empty() {
            tracing::debug!(
                service = %service,
                total = instances.len(),
                "No healthy instances to select from"
            );
            return None;
        }

        let selector: &dyn SelectionStrategy = match strategy {
            Strategy::RoundRobin => &self.round_robin,
            Strategy::Random => &self.random,
            Strategy::LeastConnections => &self.least_connections,
            Strategy::Weighted => &self.weighted,
        };
        selector.select(service, &healthy).cloned()
    }

    /// Select and hold an in-flight slot until the lease is dropped.
    pub fn acquire(&self, service: &str, instances: &[ServiceInstance]) -> Option<InstanceLease> {
        let instance = self.select(service, instances)?;
        let guard = self.connections.acquire(&instance.id);
        Some(InstanceLease {
            instance,
            _guard: guard,
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}
