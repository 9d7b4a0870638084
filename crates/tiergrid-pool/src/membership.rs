//! Membership primitives — start or stop one host under a deadline.
//!
//! Wraps the [`HostDriver`] so the rest of the pool sees typed
//! [`PoolError::Timeout`]s instead of unbounded waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use tiergrid_core::Timeouts;

use crate::driver::{HostDriver, HostTarget};
use crate::error::{PoolError, PoolResult};

#[derive(Clone)]
pub struct Membership {
    driver: Arc<dyn HostDriver>,
    timeouts: Timeouts,
}

impl Membership {
    pub fn new(driver: Arc<dyn HostDriver>, timeouts: Timeouts) -> Self {
        Self { driver, timeouts }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Install and launch a machine, then wait until it reports running.
    ///
    /// Returns the machine's physical address.
    pub async fn start_machine(&self, target: &HostTarget) -> PoolResult<String> {
        let poll = self.timeouts.poll_interval;
        let work = async {
            self.driver.install(target).await.context("install")?;
            let address = self.driver.launch(target).await.context("launch")?;
            while !self.driver.is_running(target).await.context("status probe")? {
                tokio::time::sleep(poll).await;
            }
            Ok(address)
        };
        let address = with_deadline("machine start", target, self.timeouts.machine_ready, work).await?;
        debug!(machine = %target.id(), %address, "machine reachable");
        Ok(address)
    }

    /// Install and launch a container. Returns once it is present; it need
    /// not be running yet.
    pub async fn start_container(&self, target: &HostTarget) -> PoolResult<String> {
        let work = async {
            self.driver.install(target).await.context("install")?;
            self.driver.launch(target).await.context("launch")
        };
        with_deadline(
            "container start",
            target,
            self.timeouts.container_present,
            work,
        )
        .await
    }

    pub async fn stop(&self, target: &HostTarget) -> PoolResult<()> {
        let work = async { self.driver.stop(target).await.context("stop") };
        with_deadline("stop", target, self.timeouts.stop, work).await
    }

    pub async fn allocate_heap(&self, target: &HostTarget, bytes: u64) -> PoolResult<()> {
        let work = async {
            self.driver
                .allocate_heap(target, bytes)
                .await
                .context("allocate heap")
        };
        with_deadline("heap allocation", target, self.timeouts.stop, work).await
    }
}

async fn with_deadline<T>(
    operation: &str,
    target: &HostTarget,
    deadline: Duration,
    work: impl Future<Output = anyhow::Result<T>>,
) -> PoolResult<T> {
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result
            .with_context(|| format!("{operation} of {} {}", target.kind(), target.id()))
            .map_err(PoolError::Driver),
        Err(_) => Err(PoolError::Timeout {
            operation: format!("{operation} of {} {}", target.kind(), target.id()),
            deadline,
        }),
    }
}
