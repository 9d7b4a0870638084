//! Shared types used across TierGrid crates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identity of a machine (outer-tier host).
pub type MachineId = String;

/// Identity of a container (inner-tier slot).
pub type ContainerId = String;

/// Identity of a registered dynamic location.
pub type LocationId = String;

/// Identity of any logical entity that may own a dynamic location.
pub type EntityId = String;

/// Free-form configuration flags, copied from machines into containers.
pub type Flags = HashMap<String, serde_json::Value>;

/// Flag key that pins an `obtain` to one machine.
pub const MACHINE_FLAG: &str = "machine";

/// Pool-wide aggregate metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub machines: u32,
    pub containers: u32,
    /// Mean CPU usage across containers, 0.0 when there are none.
    pub average_cpu: f64,
    /// Sum of reported heap usage.
    pub total_heap_bytes: u64,
}

/// Merge `overrides` on top of `base`, returning a new map.
pub fn merge_flags(base: &Flags, overrides: &Flags) -> Flags {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}
