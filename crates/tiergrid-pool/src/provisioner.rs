//! Machine provisioner — obtain or release one container slot on a machine.
//!
//! ```text
//! obtain(machine, flags)
//!   lock machine ── status == Running? ── spare > 0? ── push Starting member
//!   unlock
//!   start container (deadline) ── on failure: remove member, stop host
//!   create location (parent = machine location, config = machine config + flags)
//!   apply initial heap
//!
//! release(machine, location)
//!   resolve owning container ── mark Stopping ── stop host ── remove member
//!   delete location (always)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tiergrid_core::{
    ContainerId, Flags, MachineId, PoolSettings, format_name, generate_id, merge_flags,
    next_sequence,
};
use tiergrid_location::{DynamicLocation, LocationKind, LocationRegistry, LocationSpec};
use tiergrid_placement::Capacitated;

use crate::container::{Container, ContainerStatus};
use crate::error::{PoolError, PoolResult};
use crate::machine::{Machine, MachineStatus};
use crate::membership::Membership;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a caller holds for an obtained container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub container_id: ContainerId,
    pub machine_id: MachineId,
    pub location: DynamicLocation,
}

/// Outcome of growing or shrinking one machine by several containers.
#[derive(Debug)]
pub struct MachineDelta {
    pub machine: MachineId,
    /// Positive for growth, negative for shrink.
    pub requested: i64,
    pub achieved: i64,
    /// First failure. Growth stops there; shrinking carries on.
    pub error: Option<PoolError>,
}

/// Per-machine slot acquisition and release.
pub trait Provisioner: Send + Sync {
    /// Start one container on `machine` and register its location.
    fn obtain<'a>(
        &'a self,
        machine: &'a Arc<Machine>,
        flags: &'a Flags,
    ) -> BoxFuture<'a, PoolResult<ContainerHandle>>;

    /// Release the container owning `location`. Unknown members are a no-op.
    fn release<'a>(&'a self, machine: &'a Arc<Machine>, location: &'a str) -> BoxFuture<'a, PoolResult<()>>;

    /// Release a container by id. Unknown members are a no-op.
    fn release_member<'a>(
        &'a self,
        machine: &'a Arc<Machine>,
        container: &'a str,
    ) -> BoxFuture<'a, PoolResult<()>>;

    /// Obtain `count` containers one after another, stopping at the first failure.
    fn grow_by<'a>(&'a self, machine: &'a Arc<Machine>, count: u32) -> BoxFuture<'a, MachineDelta> {
        Box::pin(async move {
            let flags = Flags::new();
            let mut delta = MachineDelta {
                machine: machine.id().to_string(),
                requested: i64::from(count),
                achieved: 0,
                error: None,
            };
            for _ in 0..count {
                match self.obtain(machine, &flags).await {
                    Ok(_) => delta.achieved += 1,
                    Err(e) => {
                        delta.error = Some(e);
                        break;
                    }
                }
            }
            delta
        })
    }

    /// Release `victims`, continuing past failures and reporting the first.
    ///
    /// `achieved` counts members removed, whether or not their host stopped
    /// cleanly.
    fn shrink_by<'a>(
        &'a self,
        machine: &'a Arc<Machine>,
        victims: Vec<ContainerId>,
    ) -> BoxFuture<'a, MachineDelta> {
        Box::pin(async move {
            let mut delta = MachineDelta {
                machine: machine.id().to_string(),
                requested: -(victims.len() as i64),
                achieved: 0,
                error: None,
            };
            for victim in &victims {
                let released = self.release_member(machine, victim).await;
                // A failed stop still drops the member.
                if machine.container(victim).await.is_none() {
                    delta.achieved -= 1;
                }
                if let Err(e) = released
                    && delta.error.is_none()
                {
                    delta.error = Some(e);
                }
            }
            delta
        })
    }
}

pub struct MachineProvisioner {
    settings: Arc<PoolSettings>,
    membership: Membership,
    registry: LocationRegistry,
}

impl MachineProvisioner {
    pub fn new(settings: Arc<PoolSettings>, membership: Membership, registry: LocationRegistry) -> Self {
        Self {
            settings,
            membership,
            registry,
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    async fn obtain_on(&self, machine: &Arc<Machine>, flags: &Flags) -> PoolResult<ContainerHandle> {
        let id = generate_id("c");
        let seq = next_sequence().to_string();
        let name = format_name(
            &self.settings.container_name_format,
            &[("id", &id), ("seq", &seq), ("machine", machine.name())],
        );
        let container = Arc::new(Container::new(id.clone(), name, machine.id().to_string()));

        // Capacity check and member insert are one critical section.
        let (address, parent) = {
            let mut slots = machine.lock().await;
            if slots.status != MachineStatus::Running {
                return Err(PoolError::MachineUnavailable(machine.id().to_string()));
            }
            let Some(parent) = slots.location.clone() else {
                return Err(PoolError::MachineUnavailable(machine.id().to_string()));
            };
            if !slots.has_spare_capacity() {
                return Err(PoolError::CapacityExhausted {
                    machine: machine.id().to_string(),
                });
            }
            slots.members.push(container.clone());
            (slots.address.clone(), parent)
        };

        let target = container.target(address.clone());
        if let Err(e) = self.membership.start_container(&target).await {
            self.roll_back(machine, &container).await;
            return Err(e);
        }

        // A stop or decommission may have claimed the member while it was
        // starting. Going present and registering the location happen under
        // the machine lock so a concurrent release either sees neither or both.
        let finished = {
            let slots = machine.lock().await;
            if slots.find(&id).is_none() || !container.mark_present() {
                Err(PoolError::MachineUnavailable(machine.id().to_string()))
            } else {
                let spec = LocationSpec {
                    owner: id.clone(),
                    kind: LocationKind::Container,
                    address,
                    parent: Some(parent),
                    config: merge_flags(machine.config(), flags),
                };
                self.registry
                    .create_location(spec)
                    .inspect(|location| container.set_location(Some(location.id.clone())))
                    .map_err(PoolError::from)
            }
        };
        let location = match finished {
            Ok(location) => location,
            Err(e) => {
                self.roll_back(machine, &container).await;
                return Err(e);
            }
        };

        if let Some(bytes) = self.settings.container_heap_bytes {
            match self.membership.allocate_heap(&target, bytes).await {
                Ok(()) => {
                    container.set_heap_bytes(bytes);
                }
                Err(e) => warn!(container = %id, bytes, error = %e, "initial heap allocation failed"),
            }
        }

        info!(container = %id, machine = %machine.id(), location = %location.id, "container obtained");
        Ok(ContainerHandle {
            container_id: id,
            machine_id: machine.id().to_string(),
            location,
        })
    }

    async fn release_on(&self, machine: &Arc<Machine>, container_id: &str) -> PoolResult<()> {
        let claimed = {
            let slots = machine.lock().await;
            slots.find(container_id).filter(|c| c.begin_stop()).cloned()
        };

        let result = match claimed {
            None => {
                warn!(
                    container = %container_id,
                    machine = %machine.id(),
                    "member not found on release, nothing to stop"
                );
                Ok(())
            }
            Some(container) => {
                let address = machine.lock().await.address.clone();
                let stopped = self.membership.stop(&container.target(address)).await;
                machine.lock().await.remove(container_id);
                container.set_status(ContainerStatus::Stopped);
                container.set_location(None);
                if stopped.is_ok() {
                    info!(container = %container_id, machine = %machine.id(), "container released");
                }
                stopped
            }
        };

        self.registry.delete_location(container_id);
        result
    }

    /// Undo a half-started container: drop the member, stop the host and
    /// any location it got.
    async fn roll_back(&self, machine: &Arc<Machine>, container: &Arc<Container>) {
        let address = {
            let mut slots = machine.lock().await;
            slots.remove(container.id());
            slots.address.clone()
        };
        container.set_status(ContainerStatus::Stopped);
        if let Err(e) = self.membership.stop(&container.target(address)).await {
            debug!(container = %container.id(), error = %e, "rollback stop failed");
        }
        self.registry.delete_location(container.id());
    }
}

impl Provisioner for MachineProvisioner {
    fn obtain<'a>(
        &'a self,
        machine: &'a Arc<Machine>,
        flags: &'a Flags,
    ) -> BoxFuture<'a, PoolResult<ContainerHandle>> {
        Box::pin(self.obtain_on(machine, flags))
    }

    fn release<'a>(&'a self, machine: &'a Arc<Machine>, location: &'a str) -> BoxFuture<'a, PoolResult<()>> {
        Box::pin(async move {
            let owner = match self.registry.owner_of(location) {
                Some(owner) => Some(owner),
                None => machine
                    .lock()
                    .await
                    .members
                    .iter()
                    .find(|c| c.location().as_deref() == Some(location))
                    .map(|c| c.id().to_string()),
            };
            match owner {
                Some(container) => self.release_on(machine, &container).await,
                None => {
                    warn!(%location, machine = %machine.id(), "no container owns location, release is a no-op");
                    Ok(())
                }
            }
        })
    }

    fn release_member<'a>(
        &'a self,
        machine: &'a Arc<Machine>,
        container: &'a str,
    ) -> BoxFuture<'a, PoolResult<()>> {
        Box::pin(self.release_on(machine, container))
    }
}
