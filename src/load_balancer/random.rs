//! Uniform random load balancing strategy.

use rand::seq::SliceRandom;

use crate::discovery::ServiceInstance;
use crate::load_balancer::SelectionStrategy;

#[derive(Debug, Default)]
pub struct RandomSelect;

impl RandomSelect {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for RandomSelect {
    fn select<'a>(&self, _service: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        instances.choose(&mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_covers_all_instances() {
        let lb = RandomSelect::new();
        let backends: Vec<_> = (0..3)
            .map(|i| ServiceInstance::new(format!("i{}", i), "svc", "127.0.0.1", 8000 + i))
            .collect();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(lb.select("svc", &backends).unwrap().id.clone());
        }
        assert_eq!(seen.len(), 3);
        assert!(lb.select("svc", &[]).is_none());
    }
}
