//! In-memory host driver.
//!
//! Hosts "run" as entries in a map. Faults are injected per machine or
//! globally so that pools can be exercised without real infrastructure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use tracing::debug;

use tiergrid_core::MachineId;

use crate::driver::{DriverFuture, HostDriver, HostTarget};

pub struct SimulatedDriver {
    latency: Duration,
    machine_limit: Option<usize>,
    /// Container launches on these machines fail.
    failing: Mutex<HashSet<MachineId>>,
    fail_machine_launches: AtomicBool,
    /// Container launches never complete.
    hang_containers: AtomicBool,
    /// Machines launch but never report running.
    stall_machines: AtomicBool,
    /// Stops fail and leave the host running.
    fail_stops: AtomicBool,
    /// Running host id -> kind.
    running: Mutex<HashMap<String, &'static str>>,
    heap: Mutex<HashMap<String, u64>>,
    next_address: AtomicU32,
    launches: AtomicU64,
    stops: AtomicU64,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            machine_limit: None,
            failing: Mutex::new(HashSet::new()),
            fail_machine_launches: AtomicBool::new(false),
            hang_containers: AtomicBool::new(false),
            stall_machines: AtomicBool::new(false),
            fail_stops: AtomicBool::new(false),
            running: Mutex::new(HashMap::new()),
            heap: Mutex::new(HashMap::new()),
            next_address: AtomicU32::new(1),
            launches: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Delay applied to every launch and stop.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Refuse machine launches beyond `limit` running machines.
    pub fn with_machine_limit(mut self, limit: usize) -> Self {
        self.machine_limit = Some(limit);
        self
    }

    pub fn fail_containers_on(&self, machine: &str) {
        lock(&self.failing).insert(machine.to_string());
    }

    pub fn heal(&self, machine: &str) {
        lock(&self.failing).remove(machine);
    }

    pub fn fail_machine_launches(&self, fail: bool) {
        self.fail_machine_launches.store(fail, Ordering::SeqCst);
    }

    pub fn hang_containers(&self, hang: bool) {
        self.hang_containers.store(hang, Ordering::SeqCst);
    }

    pub fn stall_machines(&self, stall: bool) {
        self.stall_machines.store(stall, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn is_host_running(&self, id: &str) -> bool {
        lock(&self.running).contains_key(id)
    }

    pub fn running_hosts(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn heap_of(&self, id: &str) -> Option<u64> {
        lock(&self.heap).get(id).copied()
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Stop calls, failed ones included.
    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    fn running_machines(&self) -> usize {
        lock(&self.running)
            .values()
            .filter(|kind| **kind == "machine")
            .count()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver for SimulatedDriver {
    fn install<'a>(&'a self, _target: &'a HostTarget) -> DriverFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn launch<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, String> {
        Box::pin(async move {
            self.delay().await;
            self.launches.fetch_add(1, Ordering::Relaxed);

            let address = match target {
                HostTarget::Machine { id, .. } => {
                    if self.fail_machine_launches.load(Ordering::SeqCst) {
                        bail!("machine {id} failed to boot");
                    }
                    if let Some(limit) = self.machine_limit
                        && self.running_machines() >= limit
                    {
                        bail!("host quota of {limit} machines exhausted");
                    }
                    let n = self.next_address.fetch_add(1, Ordering::Relaxed);
                    format!("10.0.{}.{}", n / 250, n % 250 + 1)
                }
                HostTarget::Container {
                    id,
                    machine,
                    address,
                    ..
                } => {
                    if self.hang_containers.load(Ordering::SeqCst) {
                        std::future::pending::<()>().await;
                    }
                    if lock(&self.failing).contains(machine) {
                        bail!("container {id} failed to launch on {machine}");
                    }
                    address.clone().unwrap_or_else(|| "127.0.0.1".to_string())
                }
            };

            lock(&self.running).insert(target.id().to_string(), target.kind());
            debug!(host = %target.id(), %address, "simulated host launched");
            Ok(address)
        })
    }

    fn is_running<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            if matches!(target, HostTarget::Machine { .. })
                && self.stall_machines.load(Ordering::SeqCst)
            {
                return Ok(false);
            }
            Ok(self.is_host_running(target.id()))
        })
    }

    fn stop<'a>(&'a self, target: &'a HostTarget) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.delay().await;
            self.stops.fetch_add(1, Ordering::Relaxed);
            if self.fail_stops.load(Ordering::SeqCst) {
                bail!("host {} refused to stop", target.id());
            }
            lock(&self.running).remove(target.id());
            lock(&self.heap).remove(target.id());
            Ok(())
        })
    }

    fn allocate_heap<'a>(&'a self, target: &'a HostTarget, bytes: u64) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_host_running(target.id()) {
                bail!("host {} is not running", target.id());
            }
            lock(&self.heap).insert(target.id().to_string(), bytes);
            Ok(())
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
