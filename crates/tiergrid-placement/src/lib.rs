//! tiergrid-placement — deciding where containers go.
//!
//! Pure planning over machine snapshots. Nothing here starts or stops a
//! host; the pool executes the plans.
//!
//! # Components
//!
//! - **`capacity`** — per-machine (current, maximum) bookkeeping
//! - **`telemetry`** — optional heap/CPU samples feeding the balancer
//! - **`balancer`** — capacity-blind load-balancing selection
//! - **`strategy`** — capacity-aware placement that signals machine-tier growth
//!
//! # Placement
//!
//! ```text
//! picks     = balancer.select(candidates, n)          // ignores capacity
//! accepted  = min(picks per machine, spare capacity)  // walk picks in order
//! leftover  = fill remaining spare on any candidate
//! remaining = n - accepted
//! if remaining > 0:
//!     grow machine tier by ceil(remaining / max_slots_per_machine)
//!     place remaining on the new machines
//! ```

pub mod balancer;
pub mod capacity;
pub mod error;
pub mod strategy;
pub mod telemetry;

pub use balancer::{BalancingSelector, LoadBalancer, RoundRobinBalancer, balancer_for};
pub use capacity::{Capacitated, CapacityRecord, spare_capacity};
pub use error::{PlacementError, PlacementResult};
pub use strategy::{AdditionPlan, GrowFuture, MachineSnapshot, MachineTierGrower, PlacementStrategy};
pub use telemetry::{
    ContainerTelemetry, MachineLoad, NullTelemetry, StaticTelemetry, TelemetryFeed, machine_load,
};
