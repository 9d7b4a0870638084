//! Capacity-aware placement strategy.
//!
//! Wraps a [`LoadBalancer`] and trims its picks to each machine's spare
//! capacity. When every candidate is full, it asks the machine tier to
//! grow and places the remainder on the new machines.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tiergrid_core::{ContainerId, LocationId, MachineId};

use crate::balancer::LoadBalancer;
use crate::capacity::{Capacitated, CapacityRecord};
use crate::error::{PlacementError, PlacementResult};
use crate::telemetry::MachineLoad;

/// Point-in-time view of one machine, taken at the start of a planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub id: MachineId,
    pub name: String,
    pub location: Option<LocationId>,
    pub address: Option<String>,
    pub current: u32,
    pub maximum: u32,
    /// Live containers in insertion order.
    pub containers: Vec<ContainerId>,
    pub load: MachineLoad,
    /// Running and accepting new containers.
    pub available: bool,
}

impl Capacitated for MachineSnapshot {
    fn capacity_id(&self) -> &str {
        &self.id
    }

    fn capacity(&self) -> CapacityRecord {
        CapacityRecord {
            current: self.current,
            maximum: self.maximum,
        }
    }
}

pub type GrowFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<MachineSnapshot>>> + Send + 'a>>;

/// The outer tier, as seen by placement: something that can add machines.
pub trait MachineTierGrower: Send + Sync {
    /// Start `count` new machines and return snapshots of those that came up.
    fn grow(&self, count: u32) -> GrowFuture<'_>;
}

/// Result of the pure planning steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionPlan {
    /// One entry per accepted container, repeats allowed.
    pub targets: Vec<MachineId>,
    /// Containers that found no spare capacity.
    pub remaining: u32,
}

pub struct PlacementStrategy {
    balancer: Box<dyn LoadBalancer>,
    max_slots_per_machine: u32,
}

impl PlacementStrategy {
    pub fn new(balancer: Box<dyn LoadBalancer>, max_slots_per_machine: u32) -> Self {
        Self {
            balancer,
            max_slots_per_machine: max_slots_per_machine.max(1),
        }
    }

    pub fn balancer_name(&self) -> &'static str {
        self.balancer.name()
    }

    /// Plan `n` additions over `candidates` without growing anything.
    ///
    /// No machine is assigned more than its spare capacity.
    pub fn plan_additions(&self, candidates: &[MachineSnapshot], n: u32) -> AdditionPlan {
        let available: Vec<MachineSnapshot> =
            candidates.iter().filter(|m| m.available).cloned().collect();

        let mut spare: HashMap<&str, u32> = available
            .iter()
            .map(|m| (m.id.as_str(), m.spare_capacity()))
            .collect();

        let picks = self.balancer.select(&available, n);
        let mut targets = Vec::with_capacity(n as usize);

        for pick in picks {
            if let Some(room) = spare.get_mut(pick.as_str())
                && *room > 0
            {
                *room -= 1;
                targets.push(pick);
            }
        }

        // Picks the balancer wasted on full machines go to any spare slot.
        for m in &available {
            let room = spare.entry(m.id.as_str()).or_default();
            while (targets.len() as u32) < n && *room > 0 {
                *room -= 1;
                targets.push(m.id.clone());
            }
        }

        let remaining = n - targets.len() as u32;
        debug!(
            requested = n,
            accepted = targets.len(),
            remaining,
            balancer = self.balancer.name(),
            "placement planned"
        );
        AdditionPlan { targets, remaining }
    }

    /// Machines to add so that `remaining` containers fit.
    pub fn machines_needed(&self, remaining: u32) -> u32 {
        remaining.div_ceil(self.max_slots_per_machine)
    }

    /// Choose exactly `n` targets, growing the machine tier if needed.
    pub async fn locations_for_additions(
        &self,
        candidates: &[MachineSnapshot],
        n: u32,
        grower: &dyn MachineTierGrower,
    ) -> PlacementResult<Vec<MachineId>> {
        let mut plan = self.plan_additions(candidates, n);
        if plan.remaining == 0 {
            return Ok(plan.targets);
        }

        let needed = self.machines_needed(plan.remaining);
        debug!(remaining = plan.remaining, machines = needed, "growing machine tier for placement");

        let added = grower.grow(needed).await.map_err(PlacementError::Grow)?;
        let extra = self.plan_additions(&added, plan.remaining);
        plan.targets.extend(extra.targets);

        if extra.remaining > 0 {
            return Err(PlacementError::NoCapacityAvailable {
                requested: n,
                placed: plan.targets.len() as u32,
            });
        }
        Ok(plan.targets)
    }

    /// Pick `n` containers to remove: the first `n` in machine order.
    ///
    /// Not load-proportional; a machine is drained before the next is touched.
    pub fn entities_to_remove(
        &self,
        candidates: &[MachineSnapshot],
        n: u32,
    ) -> Vec<(MachineId, ContainerId)> {
        candidates
            .iter()
            .flat_map(|m| m.containers.iter().map(move |c| (m.id.clone(), c.clone())))
            .take(n as usize)
            .collect()
    }
}

#[cfg(test)]
impl MachineSnapshot {
    pub(crate) fn new(id: &str, current: u32, maximum: u32) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            location: None,
            address: None,
            current,
            maximum,
            containers: (0..current).map(|i| format!("{id}-c{i}")).collect(),
            load: MachineLoad::default(),
            available: true,
        }
    }
}
