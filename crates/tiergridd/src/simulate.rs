//! Simulate mode — drive a pool against the in-memory host driver.
//!
//! Each resize step prints one JSON line with the report (or error),
//! the pool metrics, and the per-machine distribution.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use tiergrid_autoscale::{Autoscaler, BoxFuture};
use tiergrid_core::{AutoscaleSettings, PoolMetrics, TierGridConfig};
use tiergrid_placement::{ContainerTelemetry, NullTelemetry, TelemetryFeed};
use tiergrid_pool::{ResizeReport, SimulatedDriver, TieredPool};

pub struct SimulateArgs {
    pub targets: Vec<i64>,
    pub latency_ms: u64,
    pub machine_limit: Option<usize>,
    /// Machine indexes whose container launches fail.
    pub fail_machines: Vec<usize>,
    pub cpu: Option<f64>,
    pub autoscale_secs: Option<u64>,
}

#[derive(Serialize)]
struct Step<'a> {
    step: usize,
    target: i64,
    report: Option<&'a ResizeReport>,
    error: Option<String>,
    metrics: PoolMetrics,
    machines: Vec<MachineLine>,
}

#[derive(Serialize)]
struct MachineLine {
    id: String,
    name: String,
    current: u32,
    maximum: u32,
}

/// Every container reports the same CPU usage.
struct UniformLoad {
    cpu: f64,
}

impl TelemetryFeed for UniformLoad {
    fn sample(&self, _container: &str) -> Option<ContainerTelemetry> {
        Some(ContainerTelemetry {
            heap_used_bytes: None,
            cpu_usage: Some(self.cpu),
            status: Some("running".to_string()),
        })
    }
}

pub async fn run(config: &TierGridConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let settings = config.pool_settings()?;
    let autoscale = config.autoscale_settings()?;

    let mut driver = SimulatedDriver::new().with_latency(Duration::from_millis(args.latency_ms));
    if let Some(limit) = args.machine_limit {
        driver = driver.with_machine_limit(limit);
    }
    let driver = Arc::new(driver);
    let telemetry: Arc<dyn TelemetryFeed> = match args.cpu {
        Some(cpu) => Arc::new(UniformLoad { cpu }),
        None => Arc::new(NullTelemetry),
    };

    let pool = Arc::new(TieredPool::start(settings, driver.clone(), telemetry).await?);
    info!(pool = %pool.id(), steps = args.targets.len(), "simulation started");

    for (step, target) in args.targets.iter().copied().enumerate() {
        mark_failing(&pool, &driver, &args.fail_machines).await;

        let result = pool.resize(target).await;
        let (report, error) = match &result {
            Ok(report) => (Some(report), None),
            Err(e) => {
                warn!(step, target, error = %e, "resize failed");
                (None, Some(e.to_string()))
            }
        };
        print_step(&pool, step, target, report, error).await?;
    }

    if let Some(secs) = args.autoscale_secs {
        match autoscale {
            Some(settings) => run_autoscaler(pool.clone(), settings, Duration::from_secs(secs)).await,
            None => warn!("--autoscale-secs given but the config has no [autoscale] section"),
        }
        let metrics = pool.metrics().await;
        println!("{}", serde_json::to_string(&metrics)?);
    }

    pool.stop().await?;
    info!(pool = %pool.id(), launches = driver.launches(), stops = driver.stops(), "simulation finished");
    Ok(())
}

async fn mark_failing(pool: &TieredPool, driver: &SimulatedDriver, indexes: &[usize]) {
    if indexes.is_empty() {
        return;
    }
    let machines = pool.machines().await;
    for &idx in indexes {
        if let Some(machine) = machines.get(idx) {
            driver.fail_containers_on(&machine.id);
        }
    }
}

async fn print_step(
    pool: &TieredPool,
    step: usize,
    target: i64,
    report: Option<&ResizeReport>,
    error: Option<String>,
) -> anyhow::Result<()> {
    let machines = pool
        .machines()
        .await
        .into_iter()
        .map(|m| MachineLine {
            id: m.id,
            name: m.name,
            current: m.current,
            maximum: m.maximum,
        })
        .collect();
    let line = Step {
        step,
        target,
        report,
        error,
        metrics: pool.metrics().await,
        machines,
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn run_autoscaler(
    pool: Arc<TieredPool>,
    settings: AutoscaleSettings,
    duration: Duration,
) {
    let metrics_pool = pool.clone();
    let scale_pool = pool.clone();
    let mut autoscaler = Autoscaler::new(settings)
        .with_metrics_fn(Box::new(move || -> BoxFuture<PoolMetrics> {
            let pool = metrics_pool.clone();
            Box::pin(async move { Ok(pool.metrics().await) })
        }))
        .with_scale_fn(Box::new(move |target: u32| -> BoxFuture<()> {
            let pool = scale_pool.clone();
            Box::pin(async move {
                pool.resize(i64::from(target)).await?;
                Ok(())
            })
        }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        autoscaler.run(shutdown_rx).await;
    });

    tokio::time::sleep(duration).await;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    info!(pool = %pool.id(), "autoscaler run finished");
}
