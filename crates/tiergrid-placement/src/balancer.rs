//! Load-balancing selection over candidate machines.
//!
//! Balancers pick `n` targets (repeats allowed) and deliberately ignore
//! capacity; the placement strategy trims their picks afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};

use tiergrid_core::{BalancerKind, MachineId};

use crate::strategy::MachineSnapshot;

/// Capacity-blind selection of `n` targets among `candidates`.
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns exactly `n` ids, or none when `candidates` is empty.
    fn select(&self, candidates: &[MachineSnapshot], n: u32) -> Vec<MachineId>;
}

/// Build the balancer named in the pool settings.
pub fn balancer_for(kind: BalancerKind) -> Box<dyn LoadBalancer> {
    match kind {
        BalancerKind::Balancing => Box::new(BalancingSelector),
        BalancerKind::RoundRobin => Box::new(RoundRobinBalancer::new()),
    }
}

/// Picks the machine with the fewest containers, counting picks already
/// made in this call. Ties go to the lower average CPU, then to the
/// earlier candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancingSelector;

impl LoadBalancer for BalancingSelector {
    fn name(&self) -> &'static str {
        "balancing"
    }

    fn select(&self, candidates: &[MachineSnapshot], n: u32) -> Vec<MachineId> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut counts: Vec<u32> = candidates.iter().map(|m| m.current).collect();
        let mut picks = Vec::with_capacity(n as usize);

        for _ in 0..n {
            let best = (0..candidates.len())
                .min_by(|&a, &b| {
                    counts[a]
                        .cmp(&counts[b])
                        .then_with(|| {
                            candidates[a]
                                .load
                                .average_cpu
                                .total_cmp(&candidates[b].load.average_cpu)
                        })
                })
                .unwrap_or(0);
            counts[best] += 1;
            picks.push(candidates[best].id.clone());
        }
        picks
    }
}

/// A round-robin balancer that cycles through candidate indices.
///
/// Uses `AtomicUsize` for lock-free concurrent selection. The counter
/// wraps around the number of candidates passed to each call.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    /// Current counter value (for diagnostics).
    pub fn current(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[MachineSnapshot], n: u32) -> Vec<MachineId> {
        (0..n)
            .filter_map(|_| self.next(candidates.len()))
            .map(|i| candidates[i].id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MachineLoad;

    fn machine(id: &str, current: u32, cpu: f64) -> MachineSnapshot {
        MachineSnapshot {
            load: MachineLoad {
                containers: current,
                average_cpu: cpu,
                heap_used_bytes: 0,
            },
            ..MachineSnapshot::new(id, current, 4)
        }
    }

    #[test]
    fn round_robin_cycles_through_indices() {
        let lb = RoundRobinBalancer::new();

        assert_eq!(lb.next(3), Some(0));
        assert_eq!(lb.next(3), Some(1));
        assert_eq!(lb.next(3), Some(2));
        assert_eq!(lb.next(3), Some(0)); // wraps
    }

    #[test]
    fn round_robin_zero_count_returns_none() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(lb.next(0), None);
        assert!(lb.select(&[], 3).is_empty());
    }

    #[test]
    fn round_robin_select_spreads_picks() {
        let lb = RoundRobinBalancer::new();
        let ms = vec![machine("a", 0, 0.0), machine("b", 0, 0.0)];
        assert_eq!(lb.select(&ms, 3), vec!["a", "b", "a"]);
        assert_eq!(lb.current(), 3);
    }

    #[test]
    fn round_robin_concurrent_safety() {
        use std::sync::Arc;
        use std::thread;

        let lb = Arc::new(RoundRobinBalancer::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let idx = lb.next(5).unwrap();
                        assert!(idx < 5);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lb.current(), 400);
    }

    #[test]
    fn balancing_prefers_emptier_machines() {
        let ms = vec![machine("a", 3, 0.0), machine("b", 1, 0.0), machine("c", 2, 0.0)];
        let picks = BalancingSelector.select(&ms, 3);
        // b -> 2, then b/c tie at 2 goes to b (earlier), then c.
        assert_eq!(picks, vec!["b", "b", "c"]);
    }

    #[test]
    fn balancing_breaks_ties_by_cpu() {
        let ms = vec![machine("a", 1, 0.9), machine("b", 1, 0.1)];
        assert_eq!(BalancingSelector.select(&ms, 1), vec!["b"]);
    }

    #[test]
    fn balancing_ignores_capacity() {
        let ms = vec![machine("full", 4, 0.0)];
        assert_eq!(BalancingSelector.select(&ms, 2), vec!["full", "full"]);
    }

    #[test]
    fn balancer_for_kind() {
        assert_eq!(balancer_for(BalancerKind::Balancing).name(), "balancing");
        assert_eq!(balancer_for(BalancerKind::RoundRobin).name(), "round_robin");
    }
}
