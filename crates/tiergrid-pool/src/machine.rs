//! Machine — one outer-tier host with a bounded number of container slots.
//!
//! All slot bookkeeping sits behind a per-machine async mutex. The
//! capacity check and the member insert in `obtain` happen under one
//! hold of that lock, which is what keeps `current <= maximum`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use tiergrid_core::{ContainerId, Flags, LocationId, MachineId};
use tiergrid_location::DynamicallyLocated;
use tiergrid_placement::{Capacitated, CapacityRecord, MachineSnapshot, TelemetryFeed, machine_load};

use crate::container::{Container, ContainerStatus};
use crate::driver::HostTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Provisioning,
    Running,
    Decommissioning,
}

/// Mutable state of a machine, guarded by its mutex.
#[derive(Debug)]
pub struct MachineSlots {
    machine_id: MachineId,
    maximum: u32,
    pub status: MachineStatus,
    pub address: Option<String>,
    pub location: Option<LocationId>,
    /// Live containers in insertion order. Their count is `current`.
    pub members: Vec<Arc<Container>>,
}

impl MachineSlots {
    pub fn find(&self, container: &str) -> Option<&Arc<Container>> {
        self.members.iter().find(|c| c.id() == container)
    }

    pub fn remove(&mut self, container: &str) -> Option<Arc<Container>> {
        let idx = self.members.iter().position(|c| c.id() == container)?;
        Some(self.members.remove(idx))
    }

    /// Containers that are up and not already being stopped.
    pub fn present(&self) -> Vec<ContainerId> {
        self.members
            .iter()
            .filter(|c| c.status() == ContainerStatus::Present)
            .map(|c| c.id().to_string())
            .collect()
    }
}

impl Capacitated for MachineSlots {
    fn capacity_id(&self) -> &str {
        &self.machine_id
    }

    fn capacity(&self) -> CapacityRecord {
        CapacityRecord {
            current: self.members.len() as u32,
            maximum: self.maximum,
        }
    }
}

#[derive(Debug)]
pub struct Machine {
    id: MachineId,
    name: String,
    max_slots: u32,
    config: Flags,
    slots: Mutex<MachineSlots>,
}

impl Machine {
    pub fn new(id: MachineId, name: String, max_slots: u32, config: Flags) -> Self {
        let slots = MachineSlots {
            machine_id: id.clone(),
            maximum: max_slots,
            status: MachineStatus::Provisioning,
            address: None,
            location: None,
            members: Vec::new(),
        };
        Self {
            id,
            name,
            max_slots,
            config,
            slots: Mutex::new(slots),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed at creation.
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Configuration copied into every container location on this machine.
    pub fn config(&self) -> &Flags {
        &self.config
    }

    /// Enter the machine's critical section.
    pub async fn lock(&self) -> MutexGuard<'_, MachineSlots> {
        self.slots.lock().await
    }

    pub async fn capacity(&self) -> CapacityRecord {
        self.lock().await.capacity()
    }

    pub async fn spare_capacity(&self) -> u32 {
        self.lock().await.spare_capacity()
    }

    pub async fn status(&self) -> MachineStatus {
        self.lock().await.status
    }

    pub async fn current(&self) -> u32 {
        self.lock().await.members.len() as u32
    }

    pub async fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.lock().await.find(id).cloned()
    }

    pub async fn snapshot(&self, telemetry: &dyn TelemetryFeed) -> MachineSnapshot {
        let slots = self.lock().await;
        let containers = slots.present();
        MachineSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            location: slots.location.clone(),
            address: slots.address.clone(),
            current: slots.members.len() as u32,
            maximum: self.max_slots,
            load: machine_load(telemetry, &containers),
            containers,
            available: slots.status == MachineStatus::Running,
        }
    }

    pub fn target(&self) -> HostTarget {
        HostTarget::Machine {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

impl DynamicallyLocated for Machine {
    fn entity_id(&self) -> &str {
        &self.id
    }
}
