//! tiergrid.toml configuration parser.
//!
//! Every section and field is optional. [`TierGridConfig::pool_settings`]
//! and [`TierGridConfig::autoscale_settings`] resolve the raw file into
//! validated settings with defaults applied.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::types::Flags;

/// Default ceiling of containers per machine.
pub const DEFAULT_MAX_SLOTS_PER_MACHINE: u32 = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierGridConfig {
    pub pool: Option<PoolConfig>,
    pub machine: Option<MachineConfig>,
    pub container: Option<ContainerConfig>,
    pub timeouts: Option<TimeoutsConfig>,
    pub placement: Option<PlacementConfig>,
    pub autoscale: Option<AutoscaleConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: Option<String>,
    pub max_slots_per_machine: Option<u32>,
    pub min_machines: Option<u32>,
    pub max_machines: Option<u32>,
    pub empty_machines: Option<EmptyMachinePolicy>,
    pub max_convergence_passes: Option<u32>,
    pub obtain_attempts: Option<u32>,
    pub location_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name_format: Option<String>,
    pub location_flags: Option<HashMap<String, toml::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name_format: Option<String>,
    pub heap_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub machine_ready: Option<String>,
    pub container_present: Option<String>,
    pub stop: Option<String>,
    pub poll_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    pub balancer: Option<BalancerKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    pub metric: Option<ScalingMetric>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub min_containers: Option<u32>,
    pub max_containers: Option<u32>,
    pub scale_up_window: Option<String>,
    pub scale_down_window: Option<String>,
    pub interval: Option<String>,
}

/// What happens to a machine whose last container is removed by a resize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyMachinePolicy {
    /// Keep the machine running with zero containers.
    #[default]
    Retain,
    /// Decommission it, never dropping below `min_machines`.
    Decommission,
}

/// Which load-balancing selection feeds the placement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// Fewest containers first, ties broken by reported load.
    #[default]
    Balancing,
    /// Cycle through machines in order.
    RoundRobin,
}

/// Pool metric watched by the autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    #[default]
    AverageCpu,
    TotalHeap,
    Containers,
}

/// Deadlines applied to host-driver calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timeouts {
    pub machine_ready: Duration,
    pub container_present: Duration,
    pub stop: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            machine_ready: Duration::from_secs(300),
            container_present: Duration::from_secs(120),
            stop: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Resolved pool settings.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSettings {
    pub name: String,
    /// Fixed for every machine at creation.
    pub max_slots_per_machine: u32,
    pub min_machines: u32,
    /// External cap on the machine tier; `None` grows without bound.
    pub max_machines: Option<u32>,
    pub empty_machines: EmptyMachinePolicy,
    pub max_convergence_passes: u32,
    pub obtain_attempts: u32,
    pub location_prefix: String,
    pub machine_name_format: String,
    pub container_name_format: String,
    pub location_flags: Flags,
    pub container_heap_bytes: Option<u64>,
    pub timeouts: Timeouts,
    pub balancer: BalancerKind,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_slots_per_machine: DEFAULT_MAX_SLOTS_PER_MACHINE,
            min_machines: 0,
            max_machines: None,
            empty_machines: EmptyMachinePolicy::Retain,
            max_convergence_passes: 4,
            obtain_attempts: 3,
            location_prefix: "tiergrid-".to_string(),
            machine_name_format: "machine-{seq}".to_string(),
            container_name_format: "container-{seq}".to_string(),
            location_flags: Flags::new(),
            container_heap_bytes: None,
            timeouts: Timeouts::default(),
            balancer: BalancerKind::Balancing,
        }
    }
}

impl PoolSettings {
    /// Reject settings the pool cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_slots_per_machine == 0 {
            bail!("max_slots_per_machine must be at least 1");
        }
        if let Some(max) = self.max_machines
            && max < self.min_machines
        {
            bail!(
                "max_machines ({max}) is below min_machines ({})",
                self.min_machines
            );
        }
        if self.max_convergence_passes == 0 {
            bail!("max_convergence_passes must be at least 1");
        }
        if self.obtain_attempts == 0 {
            bail!("obtain_attempts must be at least 1");
        }
        if self.timeouts.poll_interval.is_zero() {
            bail!("poll_interval must be non-zero");
        }
        Ok(())
    }
}

/// Resolved autoscaler settings.
#[derive(Debug, Clone, Serialize)]
pub struct AutoscaleSettings {
    pub metric: ScalingMetric,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub min_containers: u32,
    pub max_containers: u32,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
    pub interval: Duration,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            metric: ScalingMetric::AverageCpu,
            lower_bound: 0.2,
            upper_bound: 0.8,
            min_containers: 1,
            max_containers: 64,
            scale_up_window: Duration::from_secs(30),
            scale_down_window: Duration::from_secs(300),
            interval: Duration::from_secs(30),
        }
    }
}

impl TierGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: TierGridConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve the pool, machine, container, timeout and placement sections.
    pub fn pool_settings(&self) -> anyhow::Result<PoolSettings> {
        let mut s = PoolSettings::default();

        if let Some(pool) = &self.pool {
            if let Some(v) = &pool.name {
                s.name = v.clone();
            }
            if let Some(v) = pool.max_slots_per_machine {
                s.max_slots_per_machine = v;
            }
            if let Some(v) = pool.min_machines {
                s.min_machines = v;
            }
            s.max_machines = pool.max_machines;
            if let Some(v) = pool.empty_machines {
                s.empty_machines = v;
            }
            if let Some(v) = pool.max_convergence_passes {
                s.max_convergence_passes = v;
            }
            if let Some(v) = pool.obtain_attempts {
                s.obtain_attempts = v;
            }
            if let Some(v) = &pool.location_prefix {
                s.location_prefix = v.clone();
            }
        }

        if let Some(machine) = &self.machine {
            if let Some(v) = &machine.name_format {
                s.machine_name_format = v.clone();
            }
            if let Some(flags) = &machine.location_flags {
                for (k, v) in flags {
                    let value = serde_json::to_value(v)
                        .with_context(|| format!("location flag {k}"))?;
                    s.location_flags.insert(k.clone(), value);
                }
            }
        }

        if let Some(container) = &self.container {
            if let Some(v) = &container.name_format {
                s.container_name_format = v.clone();
            }
            s.container_heap_bytes = container.heap_bytes;
        }

        if let Some(t) = &self.timeouts {
            if let Some(v) = &t.machine_ready {
                s.timeouts.machine_ready = parse_duration(v)?;
            }
            if let Some(v) = &t.container_present {
                s.timeouts.container_present = parse_duration(v)?;
            }
            if let Some(v) = &t.stop {
                s.timeouts.stop = parse_duration(v)?;
            }
            if let Some(v) = &t.poll_interval {
                s.timeouts.poll_interval = parse_duration(v)?;
            }
        }

        if let Some(p) = &self.placement
            && let Some(b) = p.balancer
        {
            s.balancer = b;
        }

        s.validate()?;
        Ok(s)
    }

    /// Resolve the `[autoscale]` section, or `None` when it is absent.
    pub fn autoscale_settings(&self) -> anyhow::Result<Option<AutoscaleSettings>> {
        let Some(a) = &self.autoscale else {
            return Ok(None);
        };
        let mut s = AutoscaleSettings::default();

        if let Some(v) = a.metric {
            s.metric = v;
        }
        if let Some(v) = a.lower_bound {
            s.lower_bound = v;
        }
        if let Some(v) = a.upper_bound {
            s.upper_bound = v;
        }
        if let Some(v) = a.min_containers {
            s.min_containers = v;
        }
        if let Some(v) = a.max_containers {
            s.max_containers = v;
        }
        if let Some(v) = &a.scale_up_window {
            s.scale_up_window = parse_duration(v)?;
        }
        if let Some(v) = &a.scale_down_window {
            s.scale_down_window = parse_duration(v)?;
        }
        if let Some(v) = &a.interval {
            s.interval = parse_duration(v)?;
        }

        if s.lower_bound > s.upper_bound {
            bail!(
                "autoscale lower_bound ({}) exceeds upper_bound ({})",
                s.lower_bound,
                s.upper_bound
            );
        }
        if s.min_containers > s.max_containers {
            bail!(
                "autoscale min_containers ({}) exceeds max_containers ({})",
                s.min_containers,
                s.max_containers
            );
        }
        Ok(Some(s))
    }
}

/// Parse a duration string like "100ms", "30s", "5m" or "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parse = |n: &str| -> anyhow::Result<u64> {
        n.trim()
            .parse::<u64>()
            .with_context(|| format!("invalid duration: {s:?}"))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(mins)? * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(hours)? * 3600))
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}
