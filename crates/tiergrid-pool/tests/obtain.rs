//! Obtain/release integration tests.
//!
//! Single-container operations through the pool facade, including the
//! concurrent obtain race on one machine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tiergrid_core::{BalancerKind, Flags, MACHINE_FLAG, PoolSettings, Timeouts};
use tiergrid_location::LocationKind;
use tiergrid_placement::{ContainerTelemetry, NullTelemetry, StaticTelemetry, TelemetryFeed};
use tiergrid_pool::{PoolError, SimulatedDriver, TieredPool};

fn settings() -> PoolSettings {
    PoolSettings {
        timeouts: Timeouts {
            machine_ready: Duration::from_millis(200),
            container_present: Duration::from_millis(100),
            stop: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        },
        ..PoolSettings::default()
    }
}

async fn start_with(
    settings: PoolSettings,
    telemetry: Arc<dyn TelemetryFeed>,
) -> (TieredPool, Arc<SimulatedDriver>) {
    let driver = Arc::new(SimulatedDriver::new());
    let pool = TieredPool::start(settings, driver.clone(), telemetry)
        .await
        .unwrap();
    (pool, driver)
}

fn pinned(machine: &str) -> Flags {
    let mut flags = Flags::new();
    flags.insert(MACHINE_FLAG.to_string(), json!(machine));
    flags
}

#[tokio::test]
async fn obtain_on_empty_pool_grows_machine_tier() {
    let (pool, driver) = start_with(settings(), Arc::new(NullTelemetry)).await;

    let handle = pool.obtain(&Flags::new()).await.unwrap();
    assert_eq!(pool.machines().await.len(), 1);
    assert_eq!(pool.total_containers().await, 1);
    assert!(driver.is_host_running(&handle.container_id));

    let machine_location = pool.dynamic_location_of(&handle.machine_id).unwrap();
    assert_eq!(handle.location.kind, LocationKind::Container);
    assert_eq!(handle.location.parent.as_deref(), Some(machine_location.id.as_str()));
    assert_eq!(handle.location.id, format!("{}-{}", machine_location.id, handle.container_id));
    assert_eq!(handle.location.address, machine_location.address);
}

#[tokio::test]
async fn balancing_spreads_obtains() {
    let (pool, _) = start_with(
        PoolSettings {
            min_machines: 2,
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;

    for _ in 0..4 {
        pool.obtain(&Flags::new()).await.unwrap();
    }
    let counts: Vec<u32> = pool.machines().await.iter().map(|m| m.current).collect();
    assert_eq!(counts, vec![2, 2]);
}

#[tokio::test]
async fn round_robin_balancer_is_selectable() {
    let (pool, _) = start_with(
        PoolSettings {
            min_machines: 3,
            balancer: BalancerKind::RoundRobin,
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;

    for _ in 0..3 {
        pool.obtain(&Flags::new()).await.unwrap();
    }
    assert!(pool.machines().await.iter().all(|m| m.current == 1));
}

#[tokio::test]
async fn flags_are_merged_into_location_config() {
    let mut base = Flags::new();
    base.insert("zone".into(), json!("eu-1"));
    base.insert("tier".into(), json!("web"));
    let (pool, _) = start_with(
        PoolSettings {
            location_flags: base,
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;

    let mut flags = Flags::new();
    flags.insert("tier".into(), json!("batch"));
    let handle = pool.obtain(&flags).await.unwrap();
    assert_eq!(handle.location.config["zone"], json!("eu-1"));
    assert_eq!(handle.location.config["tier"], json!("batch"));
}

#[tokio::test]
async fn pinned_obtain_never_falls_back() {
    let (pool, _) = start_with(
        PoolSettings {
            min_machines: 2,
            max_slots_per_machine: 1,
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;
    let target = pool.machines().await[0].id.clone();

    let handle = pool.obtain(&pinned(&target)).await.unwrap();
    assert_eq!(handle.machine_id, target);

    let err = pool.obtain(&pinned(&target)).await.unwrap_err();
    assert!(matches!(err, PoolError::CapacityExhausted { machine } if machine == target));

    let err = pool.obtain(&pinned("m-missing")).await.unwrap_err();
    assert!(matches!(err, PoolError::MachineNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_obtains_never_overfill_a_machine() {
    let (pool, _) = start_with(
        PoolSettings {
            min_machines: 1,
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;
    let pool = Arc::new(pool);
    let target = pool.machines().await[0].id.clone();
    pool.obtain(&pinned(&target)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        let flags = pinned(&target);
        tasks.push(tokio::spawn(async move { pool.obtain(&flags).await }));
    }

    let mut ok = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(PoolError::CapacityExhausted { .. }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(exhausted, 7);

    let capacity = pool.capacity_of(&target).await.unwrap();
    assert_eq!(capacity.current, capacity.maximum);
}

#[tokio::test]
async fn release_is_idempotent() {
    let (pool, driver) = start_with(settings(), Arc::new(NullTelemetry)).await;
    let handle = pool.obtain(&Flags::new()).await.unwrap();

    pool.release(&handle).await.unwrap();
    assert_eq!(pool.total_containers().await, 0);
    assert!(!driver.is_host_running(&handle.container_id));
    assert!(pool.dynamic_location_of(&handle.container_id).is_none());
    let stops = driver.stops();

    pool.release(&handle).await.unwrap();
    assert_eq!(pool.total_containers().await, 0);
    assert_eq!(driver.stops(), stops);
    assert!(pool.registry().check_consistency().is_empty());
}

#[tokio::test]
async fn failed_stop_still_releases_the_slot() {
    let (pool, driver) = start_with(settings(), Arc::new(NullTelemetry)).await;
    let handle = pool.obtain(&Flags::new()).await.unwrap();
    let stops = driver.stops();
    driver.fail_stops(true);

    let err = pool.release(&handle).await.unwrap_err();
    assert!(matches!(err, PoolError::Driver(_)));
    assert_eq!(driver.stops(), stops + 1);
    assert!(pool.dynamic_location_of(&handle.container_id).is_none());
    assert_eq!(pool.total_containers().await, 0);
    assert!(pool.registry().check_consistency().is_empty());

    // the member is gone, so there is nothing left to stop
    pool.release(&handle).await.unwrap();
    assert_eq!(driver.stops(), stops + 1);
}

#[tokio::test]
async fn decommission_during_container_start_fails_the_obtain() {
    let driver = Arc::new(SimulatedDriver::new().with_latency(Duration::from_millis(50)));
    let pool = TieredPool::start(
        PoolSettings {
            min_machines: 1,
            timeouts: Timeouts {
                machine_ready: Duration::from_secs(1),
                container_present: Duration::from_secs(1),
                stop: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
            },
            ..PoolSettings::default()
        },
        driver.clone(),
        Arc::new(NullTelemetry),
    )
    .await
    .unwrap();
    let pool = Arc::new(pool);
    let target = pool.machines().await[0].id.clone();
    let locations = pool.registry().len();

    let obtaining = {
        let pool = pool.clone();
        let flags = pinned(&target);
        tokio::spawn(async move { pool.obtain(&flags).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.machine_pool().decommission(&target).await.unwrap();

    let err = obtaining.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::MachineUnavailable(ref m) if *m == target));
    assert_eq!(pool.total_containers().await, 0);
    assert_eq!(pool.registry().len(), locations - 1);
    assert!(pool.registry().check_consistency().is_empty());
    assert_eq!(driver.running_hosts(), 0);
}

#[tokio::test]
async fn location_teardown_is_idempotent() {
    let (pool, _) = start_with(settings(), Arc::new(NullTelemetry)).await;
    let handle = pool.obtain(&Flags::new()).await.unwrap();

    let first = pool.registry().delete_location(&handle.container_id);
    assert_eq!(first.map(|l| l.id), Some(handle.location.id.clone()));
    assert!(pool.registry().delete_location(&handle.container_id).is_none());

    // the container is still a member; releasing it now only stops the host
    pool.release(&handle).await.unwrap();
    assert_eq!(pool.total_containers().await, 0);
}

#[tokio::test]
async fn release_after_machine_is_gone() {
    let (pool, _) = start_with(settings(), Arc::new(NullTelemetry)).await;
    let handle = pool.obtain(&Flags::new()).await.unwrap();

    pool.machine_pool().decommission(&handle.machine_id).await.unwrap();
    pool.release(&handle).await.unwrap();
    assert!(pool.dynamic_location_of(&handle.container_id).is_none());
}

#[tokio::test]
async fn heap_allocation_returns_previous_value() {
    let (pool, driver) = start_with(
        PoolSettings {
            container_heap_bytes: Some(256 << 20),
            ..settings()
        },
        Arc::new(NullTelemetry),
    )
    .await;
    let handle = pool.obtain(&Flags::new()).await.unwrap();
    assert_eq!(driver.heap_of(&handle.container_id), Some(256 << 20));

    let previous = pool.allocate_heap(&handle.container_id, 512 << 20).await.unwrap();
    assert_eq!(previous, 256 << 20);
    assert_eq!(driver.heap_of(&handle.container_id), Some(512 << 20));

    let err = pool.allocate_heap("c-missing", 1).await.unwrap_err();
    assert!(matches!(err, PoolError::ContainerNotFound(_)));
}

#[tokio::test]
async fn metrics_aggregate_telemetry() {
    let telemetry = Arc::new(StaticTelemetry::new());
    let (pool, _) = start_with(settings(), telemetry.clone()).await;
    let a = pool.obtain(&Flags::new()).await.unwrap();
    let b = pool.obtain(&Flags::new()).await.unwrap();

    telemetry.set(
        &a.container_id,
        ContainerTelemetry {
            heap_used_bytes: Some(100),
            cpu_usage: Some(0.5),
            status: None,
        },
    );
    telemetry.set(
        &b.container_id,
        ContainerTelemetry {
            heap_used_bytes: Some(300),
            cpu_usage: Some(0.25),
            status: None,
        },
    );

    let metrics = pool.metrics().await;
    assert_eq!(metrics.machines, 1);
    assert_eq!(metrics.containers, 2);
    assert_eq!(metrics.total_heap_bytes, 400);
    assert!((metrics.average_cpu - 0.375).abs() < 1e-9);
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let driver = Arc::new(SimulatedDriver::new());
    let result = TieredPool::start(
        PoolSettings {
            max_slots_per_machine: 0,
            ..settings()
        },
        driver,
        Arc::new(NullTelemetry),
    )
    .await;
    assert!(matches!(result, Err(PoolError::InvalidSettings(_))));
}
