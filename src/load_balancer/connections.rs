//! In-flight connection tracking.
//!
//! # Responsibilities
//! - Count calls currently outstanding against each instance
//! - Release the count automatically when a call ends (RAII guard)

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-instance in-flight counters, keyed by instance id.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    counts: DashMap<String, Arc<AtomicUsize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for an instance.
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.counts
            .get(instance_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Increment the counter; the returned guard decrements it on drop.
    pub fn acquire(&self, instance_id: &str) -> ConnectionGuard {
        let counter = self
            .counts
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            instance_id: instance_id.to_string(),
            counter,
        }
    }

    /// Drop the counter of a deregistered instance.
    pub fn forget(&self, instance_id: &str) {
        self.counts.remove(instance_id);
    }
}

/// A RAII guard that manages the in-flight count of one instance.
#[derive(Debug)]
pub struct ConnectionGuard {
    instance_id: String,
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = ConnectionTracker::new();
        let g1 = tracker.acquire("i1");
        let g2 = tracker.acquire("i1");
        assert_eq!(tracker.in_flight("i1"), 2);
        assert_eq!(g1.instance_id(), "i1");

        drop(g1);
        assert_eq!(tracker.in_flight("i1"), 1);
        drop(g2);
        assert_eq!(tracker.in_flight("i1"), 0);
        assert_eq!(tracker.in_flight("unknown"), 0);
    }

    #[test]
    fn test_guard_outlives_forget() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.acquire("i1");
        tracker.forget("i1");
        drop(guard);
        assert_eq!(tracker.in_flight("i1"), 0);
    }
}
