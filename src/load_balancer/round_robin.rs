//! Round-robin load balancing strategy.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::discovery::ServiceInstance;
use crate::load_balancer::SelectionStrategy;

/// Round-robin selector.
/// Keeps one monotonic counter per service name; the counter advances on every call.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, service: &str) -> usize {
        if let Some(counter) = self.counters.get(service) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(service.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl SelectionStrategy for RoundRobin {
    fn select<'a>(&self, service: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = self.next_index(service) % instances.len();
        instances.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(n: u16) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new(format!("i{}", i), "svc", "127.0.0.1", 8000 + i))
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let backends = instances(2);

        assert_eq!(lb.select("svc", &backends).unwrap().id, "i0");
        assert_eq!(lb.select("svc", &backends).unwrap().id, "i1");
        assert_eq!(lb.select("svc", &backends).unwrap().id, "i0");
    }

    #[test]
    fn test_counters_are_per_service() {
        let lb = RoundRobin::new();
        let backends = instances(3);

        assert_eq!(lb.select("a", &backends).unwrap().id, "i0");
        assert_eq!(lb.select("b", &backends).unwrap().id, "i0");
        assert_eq!(lb.select("a", &backends).unwrap().id, "i1");
    }

    #[test]
    fn test_even_distribution() {
        let lb = RoundRobin::new();
        let backends = instances(3);
        let mut counts = [0usize; 3];
        for _ in 0..100 {
            let picked = lb.select("svc", &backends).unwrap();
            counts[(picked.port - 8000) as usize] += 1;
        }
        // floor(100/3) or ceil(100/3)
        assert!(counts.iter().all(|&c| c == 33 || c == 34));
    }

    #[test]
    fn test_empty() {
        assert!(RoundRobin::new().select("svc", &[]).is_none());
    }
}
