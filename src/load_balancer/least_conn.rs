//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::discovery::ServiceInstance;
use crate::load_balancer::{connections::ConnectionTracker, SelectionStrategy};

/// Metadata key holding a static connection count reported by the instance.
pub const CONNECTIONS_METADATA_KEY: &str = "connections";

/// Least connections selector.
/// Selects the instance with the minimum number of tracked connections.
#[derive(Debug)]
pub struct LeastConnections {
    tracker: Arc<ConnectionTracker>,
}

impl LeastConnections {
    pub fn new(tracker: Arc<ConnectionTracker>) -> Self {
        Self { tracker }
    }

    fn load(&self, instance: &ServiceInstance) -> usize {
        let reported = instance
            .metadata
            .get(CONNECTIONS_METADATA_KEY)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        reported + self.tracker.in_flight(&instance.id)
    }
}

impl SelectionStrategy for LeastConnections {
    fn select<'a>(&self, _service: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        // In case of tie, the first one is selected (stability)
        instances.iter().min_by_key(|i| self.load(i))
    }
}
