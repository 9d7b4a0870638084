//! Tiered pool — the public face of a two-tier elastic pool.
//!
//! Wires the machine tier, provisioner, placement strategy and resize
//! coordinator around one location registry.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tiergrid_core::{EntityId, Flags, MACHINE_FLAG, PoolMetrics, PoolSettings, generate_id};
use tiergrid_location::{DynamicLocation, LocationKind, LocationRegistry, LocationSpec};
use tiergrid_placement::{CapacityRecord, MachineSnapshot, PlacementStrategy, TelemetryFeed, balancer_for};

use crate::coordinator::{ResizeCoordinator, ResizeReport, ResizeState};
use crate::driver::HostDriver;
use crate::error::{PoolError, PoolResult};
use crate::membership::Membership;
use crate::pool::MachinePool;
use crate::provisioner::{ContainerHandle, Provisioner};

pub struct TieredPool {
    id: EntityId,
    settings: Arc<PoolSettings>,
    registry: LocationRegistry,
    pool: Arc<MachinePool>,
    strategy: Arc<PlacementStrategy>,
    coordinator: ResizeCoordinator,
}

impl TieredPool {
    /// Register the pool's root location and start `min_machines` machines.
    pub async fn start(
        settings: PoolSettings,
        driver: Arc<dyn HostDriver>,
        telemetry: Arc<dyn TelemetryFeed>,
    ) -> PoolResult<Self> {
        settings
            .validate()
            .map_err(|e| PoolError::InvalidSettings(e.to_string()))?;

        let id = generate_id("pool");
        let settings = Arc::new(settings);
        let registry = LocationRegistry::new(settings.location_prefix.clone());
        let root = registry.create_location(LocationSpec {
            owner: id.clone(),
            kind: LocationKind::Pool,
            address: None,
            parent: None,
            config: settings.location_flags.clone(),
        })?;

        let membership = Membership::new(driver, settings.timeouts);
        let pool = Arc::new(MachinePool::new(
            id.clone(),
            settings.clone(),
            membership,
            registry.clone(),
            telemetry,
            root.id.clone(),
        ));
        let strategy = Arc::new(PlacementStrategy::new(
            balancer_for(settings.balancer),
            settings.max_slots_per_machine,
        ));
        let coordinator = ResizeCoordinator::new(pool.clone(), strategy.clone(), settings.clone());

        let tiered = Self {
            id,
            settings,
            registry,
            pool,
            strategy,
            coordinator,
        };

        if tiered.settings.min_machines > 0
            && let Err(e) = tiered.pool.add_machines(tiered.settings.min_machines).await
        {
            tiered.registry.delete_location(&tiered.id);
            return Err(e);
        }

        let machines = tiered.pool.len().await;
        info!(
            pool = %tiered.id,
            name = %tiered.settings.name,
            location = %root.id,
            machines,
            max_slots = tiered.settings.max_slots_per_machine,
            balancer = tiered.strategy.balancer_name(),
            "pool started"
        );
        Ok(tiered)
    }

    /// Decommission every machine and unregister the root location.
    ///
    /// Keeps going past failures and returns the first one.
    pub async fn stop(&self) -> PoolResult<()> {
        let errors = self.pool.shutdown().await;
        self.registry.delete_location(&self.id);
        info!(pool = %self.id, failures = errors.len(), "pool stopped");
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn resize(&self, desired: i64) -> PoolResult<ResizeReport> {
        self.coordinator.resize(desired).await
    }

    /// Obtain one container.
    ///
    /// With a `machine` flag the container goes to that machine or fails.
    /// Otherwise the placement strategy picks a machine, growing the tier
    /// if all are full, and a stale pick is retried on a fresh snapshot.
    pub async fn obtain(&self, flags: &Flags) -> PoolResult<ContainerHandle> {
        if let Some(pinned) = flags.get(MACHINE_FLAG).and_then(|v| v.as_str()) {
            let machine = self
                .pool
                .machine(pinned)
                .await
                .ok_or_else(|| PoolError::MachineNotFound(pinned.to_string()))?;
            return self.pool.provisioner().obtain(&machine, flags).await;
        }

        let mut last_error = None;
        for attempt in 1..=self.settings.obtain_attempts {
            let snapshots = self.pool.snapshot().await;
            let targets = self
                .strategy
                .locations_for_additions(&snapshots, 1, self.pool.as_ref())
                .await?;
            let Some(target) = targets.first() else {
                break;
            };
            let Some(machine) = self.pool.machine(target).await else {
                last_error = Some(PoolError::MachineNotFound(target.clone()));
                continue;
            };

            match self.pool.provisioner().obtain(&machine, flags).await {
                Err(e) if e.is_retryable() => {
                    debug!(pool = %self.id, attempt, machine = %machine.id(), error = %e, "stale placement, retrying");
                    last_error = Some(e);
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| PoolError::NoCapacityAvailable {
            pool: self.id.clone(),
            desired: 1,
            actual: 0,
            causes: Vec::new(),
        }))
    }

    /// Release a container. Releasing twice is a no-op.
    pub async fn release(&self, handle: &ContainerHandle) -> PoolResult<()> {
        match self.pool.machine(&handle.machine_id).await {
            Some(machine) => {
                self.pool
                    .provisioner()
                    .release(&machine, &handle.location.id)
                    .await
            }
            None => {
                warn!(
                    container = %handle.container_id,
                    machine = %handle.machine_id,
                    "machine already gone, clearing container location"
                );
                self.registry.delete_location(&handle.container_id);
                Ok(())
            }
        }
    }

    /// The live location of a machine, container or the pool itself.
    pub fn dynamic_location_of(&self, entity: &str) -> Option<DynamicLocation> {
        self.registry.lookup(entity)
    }

    /// Change a container's heap allocation, returning the previous value.
    pub async fn allocate_heap(&self, container: &str, bytes: u64) -> PoolResult<u64> {
        let (machine, c) = self
            .pool
            .find_container(container)
            .await
            .ok_or_else(|| PoolError::ContainerNotFound(container.to_string()))?;
        let address = machine.lock().await.address.clone();

        self.pool
            .provisioner()
            .membership()
            .allocate_heap(&c.target(address), bytes)
            .await?;
        let previous = c.set_heap_bytes(bytes);
        debug!(%container, previous, bytes, "heap allocated");
        Ok(previous)
    }

    pub async fn capacity_of(&self, machine: &str) -> Option<CapacityRecord> {
        Some(self.pool.machine(machine).await?.capacity().await)
    }

    pub async fn machines(&self) -> Vec<MachineSnapshot> {
        self.pool.snapshot().await
    }

    pub async fn total_containers(&self) -> u32 {
        self.pool.total_current().await
    }

    pub async fn metrics(&self) -> PoolMetrics {
        self.pool.metrics().await
    }

    pub fn resize_state(&self) -> ResizeState {
        self.coordinator.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ResizeState> {
        self.coordinator.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn machine_pool(&self) -> &Arc<MachinePool> {
        &self.pool
    }
}
