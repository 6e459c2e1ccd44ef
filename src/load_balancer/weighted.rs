//! Weighted random load balancing strategy.

use rand::Rng;

use crate::discovery::ServiceInstance;
use crate::load_balancer::SelectionStrategy;

/// Cumulative-weight selector. Weight 0 instances are never picked.
#[derive(Debug, Default)]
pub struct Weighted;

impl Weighted {
    pub fn new() -> Self {
        Self
    }

    fn pick(instances: &[ServiceInstance], mut point: u64) -> Option<&ServiceInstance> {
        for instance in instances {
            let weight = instance.weight as u64;
            if point < weight {
                return Some(instance);
            }
            point -= weight;
        }
        None
    }
}

impl SelectionStrategy for Weighted {
    fn select<'a>(&self, _service: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let total: u64 = instances.iter().map(|i| i.weight as u64).sum();
        if total == 0 {
            return None;
        }
        let point = rand::thread_rng().gen_range(0..total);
        Self::pick(instances, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(id: &str, weight: u32) -> ServiceInstance {
        ServiceInstance::new(id, "svc", "127.0.0.1", 8080).with_weight(weight)
    }

    #[test]
    fn test_cumulative_pick() {
        let backends = vec![weighted("a", 1), weighted("b", 0), weighted("c", 3)];
        assert_eq!(Weighted::pick(&backends, 0).unwrap().id, "a");
        assert_eq!(Weighted::pick(&backends, 1).unwrap().id, "c");
        assert_eq!(Weighted::pick(&backends, 3).unwrap().id, "c");
        assert!(Weighted::pick(&backends, 4).is_none());
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let lb = Weighted::new();
        let backends = vec![weighted("zero", 0), weighted("one", 1)];
        for _ in 0..200 {
            assert_eq!(lb.select("svc", &backends).unwrap().id, "one");
        }
    }

    #[test]
    fn test_all_zero_is_none() {
        let lb = Weighted::new();
        assert!(lb.select("svc", &[weighted("a", 0), weighted("b", 0)]).is_none());
    }

    #[test]
    fn test_proportional() {
        let lb = Weighted::new();
        let backends = vec![weighted("light", 1), weighted("heavy", 9)];
        let heavy = (0..2000)
            .filter(|_| lb.select("svc", &backends).unwrap().id == "heavy")
            .count();
        assert!(heavy > 1600 && heavy < 1990, "heavy picked {} times", heavy);
    }
}
