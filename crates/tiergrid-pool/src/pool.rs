//! Machine pool — the outer tier.
//!
//! Holds machines in creation order. New machines are reserved in the
//! list before they boot so that concurrent growth cannot overshoot
//! `max_machines`; machines that fail to boot are dropped again.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tiergrid_core::{
    EntityId, LocationId, PoolMetrics, PoolSettings, format_name, generate_id, next_sequence,
};
use tiergrid_location::{LocationKind, LocationRegistry, LocationSpec};
use tiergrid_placement::{GrowFuture, MachineSnapshot, MachineTierGrower, TelemetryFeed};

use crate::container::Container;
use crate::driver::HostTarget;
use crate::error::{PoolError, PoolResult};
use crate::machine::{Machine, MachineStatus};
use crate::membership::Membership;
use crate::provisioner::{MachineProvisioner, Provisioner};

pub struct MachinePool {
    id: EntityId,
    settings: Arc<PoolSettings>,
    membership: Membership,
    registry: LocationRegistry,
    telemetry: Arc<dyn TelemetryFeed>,
    provisioner: MachineProvisioner,
    root_location: LocationId,
    machines: RwLock<Vec<Arc<Machine>>>,
}

impl MachinePool {
    pub fn new(
        id: EntityId,
        settings: Arc<PoolSettings>,
        membership: Membership,
        registry: LocationRegistry,
        telemetry: Arc<dyn TelemetryFeed>,
        root_location: LocationId,
    ) -> Self {
        let provisioner =
            MachineProvisioner::new(settings.clone(), membership.clone(), registry.clone());
        Self {
            id,
            settings,
            membership,
            registry,
            telemetry,
            provisioner,
            root_location,
            machines: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provisioner(&self) -> &MachineProvisioner {
        &self.provisioner
    }

    pub fn telemetry(&self) -> &dyn TelemetryFeed {
        self.telemetry.as_ref()
    }

    /// Start `count` machines in parallel.
    ///
    /// Returns the machines that came up, in creation order. Fails only
    /// if none did, or if the tier is already at `max_machines`.
    pub async fn add_machines(&self, count: u32) -> PoolResult<Vec<Arc<Machine>>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let reserved: Vec<Arc<Machine>> = {
            let mut machines = self.machines.write().await;
            let allowed = match self.settings.max_machines {
                Some(max) => {
                    let room = max.saturating_sub(machines.len() as u32);
                    if room == 0 {
                        return Err(PoolError::MachineTierExhausted {
                            pool: self.id.clone(),
                            max,
                        });
                    }
                    if room < count {
                        warn!(pool = %self.id, requested = count, allowed = room, max, "machine tier capped");
                    }
                    room.min(count)
                }
                None => count,
            };

            let fresh: Vec<Arc<Machine>> = (0..allowed).map(|_| Arc::new(self.new_machine())).collect();
            machines.extend(fresh.iter().cloned());
            fresh
        };

        let mut tasks = JoinSet::new();
        for (idx, machine) in reserved.iter().enumerate() {
            let machine = machine.clone();
            let membership = self.membership.clone();
            let registry = self.registry.clone();
            let root = self.root_location.clone();
            tasks.spawn(async move {
                let result = bring_up(&machine, &membership, &registry, root).await;
                (idx, machine, result)
            });
        }

        let mut started: Vec<(usize, Arc<Machine>)> = Vec::new();
        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, machine, Ok(()))) => started.push((idx, machine)),
                Ok((_, machine, Err(e))) => {
                    warn!(pool = %self.id, machine = %machine.id(), error = %e, "machine failed to start");
                    self.discard(&machine).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(pool = %self.id, error = %e, "machine start task failed");
                    last_error = Some(PoolError::Driver(anyhow::anyhow!("machine start task failed: {e}")));
                }
            }
        }

        if started.is_empty() {
            return Err(last_error.unwrap_or(PoolError::MachineTierExhausted {
                pool: self.id.clone(),
                max: self.settings.max_machines.unwrap_or(0),
            }));
        }

        started.sort_by_key(|(idx, _)| *idx);
        let started: Vec<Arc<Machine>> = started.into_iter().map(|(_, m)| m).collect();
        let machines = self.len().await;
        info!(
            pool = %self.id,
            requested = count,
            started = started.len(),
            machines,
            "machine tier grown"
        );
        Ok(started)
    }

    /// Stop every container on a machine, then the machine itself, and
    /// remove it from the pool.
    pub async fn decommission(&self, machine_id: &str) -> PoolResult<()> {
        let machine = self
            .machine(machine_id)
            .await
            .ok_or_else(|| PoolError::MachineNotFound(machine_id.to_string()))?;

        let victims: Vec<String> = {
            let mut slots = machine.lock().await;
            slots.status = MachineStatus::Decommissioning;
            slots.members.iter().map(|c| c.id().to_string()).collect()
        };
        for victim in &victims {
            if let Err(e) = self.provisioner.release_member(&machine, victim).await {
                warn!(machine = %machine_id, container = %victim, error = %e, "container stop failed during decommission");
            }
        }

        let stopped = self.membership.stop(&machine.target()).await;
        self.discard(&machine).await;
        info!(pool = %self.id, machine = %machine_id, containers = victims.len(), "machine decommissioned");
        stopped
    }

    pub async fn machines(&self) -> Vec<Arc<Machine>> {
        self.machines.read().await.clone()
    }

    pub async fn machine(&self, id: &str) -> Option<Arc<Machine>> {
        self.machines
            .read()
            .await
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Locate a container anywhere in the pool.
    pub async fn find_container(&self, id: &str) -> Option<(Arc<Machine>, Arc<Container>)> {
        for machine in self.machines().await {
            if let Some(c) = machine.container(id).await {
                return Some((machine, c));
            }
        }
        None
    }

    /// Σ current over machines.
    pub async fn total_current(&self) -> u32 {
        let mut total = 0;
        for machine in self.machines().await {
            total += machine.current().await;
        }
        total
    }

    /// Σ maximum over machines.
    pub async fn total_capacity(&self) -> u32 {
        self.machines
            .read()
            .await
            .iter()
            .map(|m| m.max_slots())
            .sum()
    }

    pub async fn snapshot(&self) -> Vec<MachineSnapshot> {
        let mut snaps = Vec::new();
        for machine in self.machines().await {
            snaps.push(machine.snapshot(self.telemetry.as_ref()).await);
        }
        snaps
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let snaps = self.snapshot().await;
        let containers: u32 = snaps.iter().map(|s| s.current).sum();
        let sampled: u32 = snaps.iter().map(|s| s.load.containers).sum();
        let cpu: f64 = snaps
            .iter()
            .map(|s| s.load.average_cpu * f64::from(s.load.containers))
            .sum();

        PoolMetrics {
            machines: snaps.len() as u32,
            containers,
            average_cpu: if sampled == 0 { 0.0 } else { cpu / f64::from(sampled) },
            total_heap_bytes: snaps.iter().map(|s| s.load.heap_used_bytes).sum(),
        }
    }

    /// Decommission every machine.
    pub async fn shutdown(&self) -> Vec<PoolError> {
        let mut errors = Vec::new();
        for machine in self.machines().await {
            if let Err(e) = self.decommission(machine.id()).await {
                errors.push(e);
            }
        }
        errors
    }

    // ── Internal helpers ────────────────────────────────────────

    fn new_machine(&self) -> Machine {
        let id = generate_id("m");
        let seq = next_sequence().to_string();
        let name = format_name(
            &self.settings.machine_name_format,
            &[("id", &id), ("seq", &seq), ("pool", &self.id)],
        );
        Machine::new(
            id,
            name,
            self.settings.max_slots_per_machine,
            self.settings.location_flags.clone(),
        )
    }

    async fn discard(&self, machine: &Arc<Machine>) {
        self.registry.delete_location(machine.id());
        self.machines
            .write()
            .await
            .retain(|m| !Arc::ptr_eq(m, machine));
    }
}

/// Boot a reserved machine and register its location under the pool root.
async fn bring_up(
    machine: &Arc<Machine>,
    membership: &Membership,
    registry: &LocationRegistry,
    root: LocationId,
) -> PoolResult<()> {
    let target = machine.target();
    let address = match membership.start_machine(&target).await {
        Ok(address) => address,
        Err(e) => {
            stop_after_failed_boot(machine, membership, &target).await;
            return Err(e);
        }
    };

    let location = registry.create_location(LocationSpec {
        owner: machine.id().to_string(),
        kind: LocationKind::Machine,
        address: Some(address.clone()),
        parent: Some(root),
        config: machine.config().clone(),
    });
    let location = match location {
        Ok(location) => location,
        Err(e) => {
            stop_after_failed_boot(machine, membership, &target).await;
            return Err(e.into());
        }
    };

    let mut slots = machine.lock().await;
    slots.address = Some(address);
    slots.location = Some(location.id);
    slots.status = MachineStatus::Running;
    Ok(())
}

async fn stop_after_failed_boot(machine: &Machine, membership: &Membership, target: &HostTarget) {
    if let Err(e) = membership.stop(target).await {
        debug!(machine = %machine.id(), error = %e, "rollback stop failed");
    }
}

impl MachineTierGrower for MachinePool {
    fn grow(&self, count: u32) -> GrowFuture<'_> {
        Box::pin(async move {
            let added = self.add_machines(count).await?;
            let mut snaps = Vec::with_capacity(added.len());
            for machine in added {
                snaps.push(machine.snapshot(self.telemetry.as_ref()).await);
            }
            Ok(snaps)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDriver;
    use tiergrid_core::Flags;
    use tiergrid_placement::NullTelemetry;

    fn pool_with(settings: PoolSettings, driver: Arc<SimulatedDriver>) -> (MachinePool, LocationRegistry) {
        let registry = LocationRegistry::new("t-");
        let root = registry
            .create_location(LocationSpec {
                owner: "p1".into(),
                kind: LocationKind::Pool,
                address: None,
                parent: None,
                config: Flags::new(),
            })
            .unwrap();
        let settings = Arc::new(settings);
        let membership = Membership::new(driver, settings.timeouts);
        let pool = MachinePool::new(
            "p1".into(),
            settings,
            membership,
            registry.clone(),
            Arc::new(NullTelemetry),
            root.id,
        );
        (pool, registry)
    }

    #[tokio::test]
    async fn add_machines_registers_locations() {
        let driver = Arc::new(SimulatedDriver::new());
        let (pool, registry) = pool_with(PoolSettings::default(), driver.clone());

        let added = pool.add_machines(3).await.unwrap();
        assert_eq!(added.len(), 3);
        assert_eq!(pool.len().await, 3);
        assert_eq!(pool.total_capacity().await, 12);
        assert_eq!(registry.children("t-p1").len(), 3);
        for m in &added {
            assert_eq!(m.status().await, MachineStatus::Running);
            assert!(driver.is_host_running(m.id()));
        }
    }

    #[tokio::test]
    async fn max_machines_caps_growth() {
        let settings = PoolSettings {
            max_machines: Some(2),
            ..PoolSettings::default()
        };
        let (pool, _) = pool_with(settings, Arc::new(SimulatedDriver::new()));

        assert_eq!(pool.add_machines(3).await.unwrap().len(), 2);
        let err = pool.add_machines(1).await.unwrap_err();
        assert!(matches!(err, PoolError::MachineTierExhausted { max: 2, .. }));
    }

    #[tokio::test]
    async fn failed_boot_leaves_no_trace() {
        let driver = Arc::new(SimulatedDriver::new());
        driver.fail_machine_launches(true);
        let (pool, registry) = pool_with(PoolSettings::default(), driver);

        let err = pool.add_machines(2).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(_)));
        assert!(pool.is_empty().await);
        assert!(registry.children("t-p1").is_empty());
    }

    #[tokio::test]
    async fn failed_boot_with_failed_stop_keeps_boot_error() {
        let driver = Arc::new(SimulatedDriver::new());
        driver.fail_machine_launches(true);
        driver.fail_stops(true);
        let (pool, registry) = pool_with(PoolSettings::default(), driver.clone());

        let err = pool.add_machines(2).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(ref e) if format!("{e:#}").contains("failed to boot")));
        assert_eq!(driver.stops(), 2);
        assert!(pool.is_empty().await);
        assert!(registry.children("t-p1").is_empty());
    }

    #[tokio::test]
    async fn decommission_stops_containers_and_machine() {
        let driver = Arc::new(SimulatedDriver::new());
        let (pool, registry) = pool_with(PoolSettings::default(), driver.clone());
        let machine = pool.add_machines(1).await.unwrap().remove(0);
        pool.provisioner().grow_by(&machine, 2).await;
        assert_eq!(driver.running_hosts(), 3);

        pool.decommission(machine.id()).await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(driver.running_hosts(), 0);
        assert_eq!(registry.len(), 1); // only the root remains
        assert!(registry.check_consistency().is_empty());
    }

    #[tokio::test]
    async fn decommission_unknown_machine() {
        let (pool, _) = pool_with(PoolSettings::default(), Arc::new(SimulatedDriver::new()));
        assert!(matches!(
            pool.decommission("m-missing").await,
            Err(PoolError::MachineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn grower_returns_available_snapshots() {
        let (pool, _) = pool_with(PoolSettings::default(), Arc::new(SimulatedDriver::new()));
        let snaps = MachineTierGrower::grow(&pool, 2).await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.available && s.current == 0 && s.maximum == 4));
    }

    #[tokio::test]
    async fn machine_names_follow_format() {
        let settings = PoolSettings {
            machine_name_format: "jvm-{pool}-{seq}".into(),
            ..PoolSettings::default()
        };
        let (pool, _) = pool_with(settings, Arc::new(SimulatedDriver::new()));
        let m = pool.add_machines(1).await.unwrap().remove(0);
        assert!(m.name().starts_with("jvm-p1-"));
    }
}
