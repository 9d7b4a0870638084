//! Resize coordinator — drive the whole pool to a desired container count.
//!
//! Resizes are serialized end to end. Each resize runs passes until the
//! pool converges, stops making progress, or hits the pass limit:
//!
//! ```text
//! delta = desired - Σ current
//! delta > 0 (Growing):
//!     fill room on existing machines in order
//!     remainder → add ceil(remainder / max_slots) machines, fill those
//!     grow_by on every planned machine in parallel
//! delta < 0 (Shrinking):
//!     victims = first |delta| present containers in machine order
//!     shrink_by on every affected machine in parallel
//!     optionally decommission machines left empty
//! repeat while Σ current moved and still != desired
//! ```
//!
//! Per-machine failures are collected into the report. The call fails
//! only if the pool made no net progress at all.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tiergrid_core::{ContainerId, EmptyMachinePolicy, MachineId, PoolSettings};
use tiergrid_placement::{Capacitated, PlacementStrategy};

use crate::error::{PoolError, PoolResult};
use crate::machine::{Machine, MachineStatus};
use crate::pool::MachinePool;
use crate::provisioner::{MachineDelta, Provisioner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeState {
    Stable,
    Growing,
    Shrinking,
}

/// Per-machine line of a [`ResizeReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaReport {
    pub machine: MachineId,
    pub requested: i64,
    pub achieved: i64,
    pub error: Option<String>,
}

/// What a resize did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResizeReport {
    pub desired: u32,
    pub initial: u32,
    /// Σ current after the last pass.
    pub actual: u32,
    pub passes: u32,
    pub machines_added: u32,
    pub machines_removed: u32,
    pub deltas: Vec<DeltaReport>,
    /// Collected sub-operation failures. Diagnostic only.
    pub errors: Vec<String>,
}

impl ResizeReport {
    pub fn is_complete(&self) -> bool {
        self.actual == self.desired
    }

    fn record(&mut self, delta: MachineDelta) {
        let error = delta.error.map(|e| e.to_string());
        if let Some(e) = &error {
            self.errors.push(format!("{}: {e}", delta.machine));
        }
        self.deltas.push(DeltaReport {
            machine: delta.machine,
            requested: delta.requested,
            achieved: delta.achieved,
            error,
        });
    }
}

pub struct ResizeCoordinator {
    pool: Arc<MachinePool>,
    strategy: Arc<PlacementStrategy>,
    settings: Arc<PoolSettings>,
    /// Held for the whole of a resize, including self-correction passes.
    resize_lock: Mutex<()>,
    state: watch::Sender<ResizeState>,
}

impl ResizeCoordinator {
    pub fn new(
        pool: Arc<MachinePool>,
        strategy: Arc<PlacementStrategy>,
        settings: Arc<PoolSettings>,
    ) -> Self {
        let (state, _) = watch::channel(ResizeState::Stable);
        Self {
            pool,
            strategy,
            settings,
            resize_lock: Mutex::new(()),
            state,
        }
    }

    pub fn state(&self) -> ResizeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResizeState> {
        self.state.subscribe()
    }

    /// Resize the pool to `desired` containers. Negative targets clamp to zero.
    pub async fn resize(&self, desired: i64) -> PoolResult<ResizeReport> {
        let desired = u32::try_from(desired.max(0)).unwrap_or(u32::MAX);
        let _serial = self.resize_lock.lock().await;

        let initial = self.pool.total_current().await;
        let mut report = ResizeReport {
            desired,
            initial,
            actual: initial,
            ..ResizeReport::default()
        };
        if desired == initial {
            debug!(pool = %self.pool.id(), desired, "resize is a no-op");
            return Ok(report);
        }

        info!(pool = %self.pool.id(), from = initial, to = desired, "resize started");

        for pass in 1..=self.settings.max_convergence_passes {
            let current = self.pool.total_current().await;
            if current == desired {
                break;
            }
            report.passes = pass;

            if desired > current {
                self.state.send_replace(ResizeState::Growing);
                self.grow_pass(desired - current, &mut report).await;
            } else {
                self.state.send_replace(ResizeState::Shrinking);
                self.shrink_pass(current - desired, &mut report).await;
            }

            let after = self.pool.total_current().await;
            debug!(pool = %self.pool.id(), pass, before = current, after, desired, "resize pass finished");
            if after == current {
                break;
            }
        }

        self.state.send_replace(ResizeState::Stable);
        report.actual = self.pool.total_current().await;

        if report.actual == initial {
            warn!(pool = %self.pool.id(), desired, actual = report.actual, "resize made no progress");
            return Err(PoolError::NoCapacityAvailable {
                pool: self.pool.id().to_string(),
                desired,
                actual: report.actual,
                causes: report.errors,
            });
        }

        if report.is_complete() {
            info!(pool = %self.pool.id(), actual = report.actual, passes = report.passes, "resize finished");
        } else {
            warn!(
                pool = %self.pool.id(),
                desired,
                actual = report.actual,
                errors = report.errors.len(),
                "resize finished short of target"
            );
        }
        Ok(report)
    }

    // ── Passes ──────────────────────────────────────────────────

    async fn grow_pass(&self, delta: u32, report: &mut ResizeReport) {
        let mut remaining = delta;
        let mut plan: Vec<(Arc<Machine>, u32)> = Vec::new();

        for machine in self.pool.machines().await {
            if remaining == 0 {
                break;
            }
            let room = {
                let slots = machine.lock().await;
                if slots.status != MachineStatus::Running {
                    continue;
                }
                slots.spare_capacity()
            };
            if room > 0 {
                let take = remaining.min(room);
                plan.push((machine, take));
                remaining -= take;
            }
        }

        if remaining > 0 {
            let needed = self.strategy.machines_needed(remaining);
            match self.pool.add_machines(needed).await {
                Ok(added) => {
                    report.machines_added += added.len() as u32;
                    for machine in added {
                        if remaining == 0 {
                            break;
                        }
                        let take = remaining.min(machine.max_slots());
                        plan.push((machine, take));
                        remaining -= take;
                    }
                }
                Err(e) => {
                    warn!(pool = %self.pool.id(), needed, error = %e, "machine tier growth failed");
                    report.errors.push(e.to_string());
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (machine, take) in plan {
            let pool = self.pool.clone();
            debug!(machine = %machine.id(), take, "growing machine");
            tasks.spawn(async move { pool.provisioner().grow_by(&machine, take).await });
        }
        self.collect(tasks, report).await;
    }

    async fn shrink_pass(&self, delta: u32, report: &mut ResizeReport) {
        let snapshots = self.pool.snapshot().await;
        let victims = self.strategy.entities_to_remove(&snapshots, delta);

        let mut by_machine: Vec<(MachineId, Vec<ContainerId>)> = Vec::new();
        for (machine, container) in victims {
            match by_machine.last_mut() {
                Some((m, list)) if *m == machine => list.push(container),
                _ => by_machine.push((machine, vec![container])),
            }
        }

        let mut tasks = JoinSet::new();
        let mut touched = Vec::new();
        for (machine_id, list) in by_machine {
            let Some(machine) = self.pool.machine(&machine_id).await else {
                continue;
            };
            touched.push(machine.clone());
            let pool = self.pool.clone();
            debug!(machine = %machine_id, take = list.len(), "shrinking machine");
            tasks.spawn(async move { pool.provisioner().shrink_by(&machine, list).await });
        }
        self.collect(tasks, report).await;

        if self.settings.empty_machines == EmptyMachinePolicy::Decommission {
            self.decommission_empty(touched, report).await;
        }
    }

    /// Remove machines left empty by a shrink, keeping `min_machines`.
    async fn decommission_empty(&self, touched: Vec<Arc<Machine>>, report: &mut ResizeReport) {
        let floor = self.settings.min_machines as usize;
        for machine in touched {
            if self.pool.len().await <= floor {
                break;
            }
            if machine.current().await > 0 {
                continue;
            }
            match self.pool.decommission(machine.id()).await {
                Ok(()) => report.machines_removed += 1,
                Err(e) => {
                    warn!(machine = %machine.id(), error = %e, "decommission of empty machine failed");
                    report.errors.push(format!("{}: {e}", machine.id()));
                }
            }
        }
    }

    async fn collect(&self, mut tasks: JoinSet<MachineDelta>, report: &mut ResizeReport) {
        let mut deltas: HashMap<MachineId, MachineDelta> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(delta) => {
                    if let Some(e) = &delta.error {
                        warn!(machine = %delta.machine, requested = delta.requested, achieved = delta.achieved, error = %e, "machine resize failed");
                    }
                    deltas.insert(delta.machine.clone(), delta);
                }
                Err(e) => {
                    warn!(error = %e, "machine resize task failed");
                    report.errors.push(format!("resize task failed: {e}"));
                }
            }
        }

        // Report in pool order.
        for machine in self.pool.machines().await {
            if let Some(delta) = deltas.remove(machine.id()) {
                report.record(delta);
            }
        }
        for (_, delta) in deltas {
            report.record(delta);
        }
    }
}
