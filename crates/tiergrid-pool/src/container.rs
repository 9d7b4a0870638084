//! Container — one inner-tier execution slot on exactly one machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use tiergrid_core::{ContainerId, LocationId, MachineId};
use tiergrid_location::DynamicallyLocated;

use crate::driver::HostTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    /// Launched and reachable through its location.
    Present,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    name: String,
    machine_id: MachineId,
    heap_bytes: AtomicU64,
    status: Mutex<ContainerStatus>,
    location: Mutex<Option<LocationId>>,
}

impl Container {
    pub fn new(id: ContainerId, name: String, machine_id: MachineId) -> Self {
        Self {
            id,
            name,
            machine_id,
            heap_bytes: AtomicU64::new(0),
            status: Mutex::new(ContainerStatus::Starting),
            location: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set at creation, never changes.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn heap_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Acquire)
    }

    /// Record a new heap allocation, returning the previous one.
    pub fn set_heap_bytes(&self, bytes: u64) -> u64 {
        self.heap_bytes.swap(bytes, Ordering::AcqRel)
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Move from `Starting` to `Present`.
    ///
    /// Returns `false` if a stop claimed the container first.
    pub fn mark_present(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != ContainerStatus::Starting {
            return false;
        }
        *status = ContainerStatus::Present;
        true
    }

    /// Mark as stopping unless already on the way out.
    ///
    /// Returns `false` if another caller got there first.
    pub fn begin_stop(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        match *status {
            ContainerStatus::Stopping | ContainerStatus::Stopped => false,
            _ => {
                *status = ContainerStatus::Stopping;
                true
            }
        }
    }

    /// Id of the registered location, once created.
    pub fn location(&self) -> Option<LocationId> {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_location(&self, location: Option<LocationId>) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = location;
    }

    pub fn target(&self, machine_address: Option<String>) -> HostTarget {
        HostTarget::Container {
            id: self.id.clone(),
            name: self.name.clone(),
            machine: self.machine_id.clone(),
            address: machine_address,
        }
    }
}

impl DynamicallyLocated for Container {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Container {
        Container::new("c-1".into(), "container-1".into(), "m-1".into())
    }

    #[test]
    fn starts_in_starting_state() {
        let c = container();
        assert_eq!(c.status(), ContainerStatus::Starting);
        assert_eq!(c.heap_bytes(), 0);
        assert!(c.location().is_none());
    }

    #[test]
    fn present_only_from_starting() {
        let c = container();
        assert!(c.mark_present());
        assert_eq!(c.status(), ContainerStatus::Present);
        assert!(!c.mark_present());

        let stopped = container();
        assert!(stopped.begin_stop());
        assert!(!stopped.mark_present());
        assert_eq!(stopped.status(), ContainerStatus::Stopping);
    }

    #[test]
    fn heap_swap_returns_previous() {
        let c = container();
        assert_eq!(c.set_heap_bytes(512), 0);
        assert_eq!(c.set_heap_bytes(1024), 512);
        assert_eq!(c.heap_bytes(), 1024);
    }

    #[test]
    fn begin_stop_only_once() {
        let c = container();
        c.set_status(ContainerStatus::Present);
        assert!(c.begin_stop());
        assert!(!c.begin_stop());
        assert_eq!(c.status(), ContainerStatus::Stopping);
    }

    #[test]
    fn target_carries_machine() {
        let c = container();
        match c.target(Some("10.0.0.2".into())) {
            HostTarget::Container { machine, address, .. } => {
                assert_eq!(machine, "m-1");
                assert_eq!(address.as_deref(), Some("10.0.0.2"));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }
}
