//! tiergrid-pool — a two-tier elastic pool of machines and containers.
//!
//! Clients ask for containers without knowing which machine hosts them.
//! The pool places each container on a machine with spare capacity,
//! grows the machine tier when every machine is full, and shrinks both
//! tiers when demand drops.
//!
//! # Architecture
//!
//! ```text
//! TieredPool
//!   ├── ResizeCoordinator (serialized resize, Stable/Growing/Shrinking)
//!   ├── PlacementStrategy (from tiergrid-placement)
//!   ├── LocationRegistry  (from tiergrid-location)
//!   └── MachinePool (outer tier)
//!       ├── MachineProvisioner (obtain / release one slot)
//!       ├── Membership (host driver calls under deadlines)
//!       └── Machine (per-machine mutex over its containers)
//!           └── Container
//! ```

pub mod container;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod machine;
pub mod membership;
pub mod pool;
pub mod provisioner;
pub mod sim;
pub mod tiered;

pub use container::{Container, ContainerStatus};
pub use coordinator::{DeltaReport, ResizeCoordinator, ResizeReport, ResizeState};
pub use driver::{DriverFuture, HostDriver, HostTarget};
pub use error::{PoolError, PoolResult};
pub use machine::{Machine, MachineSlots, MachineStatus};
pub use membership::Membership;
pub use pool::MachinePool;
pub use provisioner::{BoxFuture, ContainerHandle, MachineDelta, MachineProvisioner, Provisioner};
pub use sim::SimulatedDriver;
pub use tiered::TieredPool;
