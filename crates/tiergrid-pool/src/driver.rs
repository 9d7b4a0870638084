//! Host driver interface.
//!
//! The driver installs, launches, probes and stops the physical host
//! behind a machine or a container. It is provided by the embedding
//! application; the pool only reaches it through [`Membership`].
//!
//! [`Membership`]: crate::membership::Membership

use std::future::Future;
use std::pin::Pin;

use tiergrid_core::{ContainerId, MachineId};

pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// What a driver call acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    Machine {
        id: MachineId,
        name: String,
    },
    Container {
        id: ContainerId,
        name: String,
        machine: MachineId,
        /// Address of the hosting machine.
        address: Option<String>,
    },
}

impl HostTarget {
    pub fn id(&self) -> &str {
        match self {
            HostTarget::Machine { id, .. } | HostTarget::Container { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HostTarget::Machine { .. } => "machine",
            HostTarget::Container { .. } => "container",
        }
    }
}

/// Lifecycle calls against a physical host. Every call may block and may fail.
pub trait HostDriver: Send + Sync {
    fn install<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, ()>;

    /// Launch the host and return its physical address.
    fn launch<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, String>;

    fn is_running<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, bool>;

    fn stop<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, ()>;

    /// Change a container's heap allocation. Drivers without the
    /// capability accept and ignore it.
    fn allocate_heap<'a>(&'a self, _target: &'a HostTarget, _bytes: u64) -> DriverFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
