//! Telemetry feed — read-only heap/CPU/status samples per container.
//!
//! Placement uses telemetry opportunistically. A container without a
//! sample, or a sample missing a metric, contributes zero load.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use tiergrid_core::ContainerId;

/// Latest sample for one container. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerTelemetry {
    pub heap_used_bytes: Option<u64>,
    /// Fraction of one CPU, 0.0..=1.0.
    pub cpu_usage: Option<f64>,
    pub status: Option<String>,
}

/// Source of container samples.
pub trait TelemetryFeed: Send + Sync {
    fn sample(&self, container: &str) -> Option<ContainerTelemetry>;
}

/// A feed with no data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetryFeed for NullTelemetry {
    fn sample(&self, _container: &str) -> Option<ContainerTelemetry> {
        None
    }
}

/// An in-memory feed whose samples are pushed by the caller.
#[derive(Debug, Default)]
pub struct StaticTelemetry {
    samples: RwLock<HashMap<ContainerId, ContainerTelemetry>>,
}

impl StaticTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, container: &str, sample: ContainerTelemetry) {
        self.samples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.to_string(), sample);
    }

    pub fn remove(&self, container: &str) {
        self.samples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container);
    }
}

impl TelemetryFeed for StaticTelemetry {
    fn sample(&self, container: &str) -> Option<ContainerTelemetry> {
        self.samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
            .cloned()
    }
}

/// Aggregated load of one machine's containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineLoad {
    pub containers: u32,
    /// Mean CPU across containers.
    pub average_cpu: f64,
    /// Sum of heap usage across containers.
    pub heap_used_bytes: u64,
}

/// Sum heap and average CPU over `containers`.
pub fn machine_load(feed: &dyn TelemetryFeed, containers: &[ContainerId]) -> MachineLoad {
    if containers.is_empty() {
        return MachineLoad::default();
    }

    let mut cpu = 0.0;
    let mut heap = 0u64;
    for id in containers {
        if let Some(sample) = feed.sample(id) {
            cpu += sample.cpu_usage.unwrap_or(0.0);
            heap = heap.saturating_add(sample.heap_used_bytes.unwrap_or(0));
        }
    }

    MachineLoad {
        containers: containers.len() as u32,
        average_cpu: cpu / containers.len() as f64,
        heap_used_bytes: heap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ContainerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn null_feed_yields_zero_load() {
        let load = machine_load(&NullTelemetry, &ids(&["c1", "c2"]));
        assert_eq!(load.containers, 2);
        assert_eq!(load.average_cpu, 0.0);
        assert_eq!(load.heap_used_bytes, 0);
    }

    #[test]
    fn missing_samples_count_as_zero() {
        let feed = StaticTelemetry::new();
        feed.set(
            "c1",
            ContainerTelemetry {
                heap_used_bytes: Some(100),
                cpu_usage: Some(0.8),
                status: Some("running".into()),
            },
        );
        feed.set(
            "c2",
            ContainerTelemetry {
                heap_used_bytes: None,
                cpu_usage: Some(0.4),
                status: None,
            },
        );

        let load = machine_load(&feed, &ids(&["c1", "c2", "c3"]));
        assert_eq!(load.containers, 3);
        assert!((load.average_cpu - 0.4).abs() < 1e-9);
        assert_eq!(load.heap_used_bytes, 100);
    }

    #[test]
    fn removed_sample_is_gone() {
        let feed = StaticTelemetry::new();
        feed.set("c1", ContainerTelemetry::default());
        assert!(feed.sample("c1").is_some());
        feed.remove("c1");
        assert!(feed.sample("c1").is_none());
    }

    #[test]
    fn empty_machine_has_default_load() {
        assert_eq!(machine_load(&NullTelemetry, &[]), MachineLoad::default());
    }
}
