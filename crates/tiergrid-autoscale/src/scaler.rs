//! Autoscaler — keep a pool metric inside a band by resizing the pool.
//!
//! Metrics come from a callback (usually `TieredPool::metrics`) and the
//! resulting target goes to another (usually `TieredPool::resize`).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use tiergrid_core::{AutoscaleSettings, PoolMetrics, ScalingMetric};

/// A scaling decision for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Resize the pool to this many containers.
    ScaleTo(u32),
    NoChange,
}

/// Future returned by the autoscaler callbacks.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<T>> + Send>>;

/// Produces the latest pool metrics.
pub type MetricsCallback = Box<dyn Fn() -> BoxFuture<PoolMetrics> + Send + Sync>;

/// Performs a resize to the given container count.
pub type ScaleCallback = Box<dyn Fn(u32) -> BoxFuture<()> + Send + Sync>;

/// Cooldown bookkeeping.
#[derive(Debug, Default)]
struct ScaleState {
    last_scale_up: u64,
    last_scale_down: u64,
}

pub struct Autoscaler {
    settings: AutoscaleSettings,
    state: ScaleState,
    metrics_fn: Option<MetricsCallback>,
    scale_fn: Option<ScaleCallback>,
}

impl Autoscaler {
    pub fn new(settings: AutoscaleSettings) -> Self {
        Self {
            settings,
            state: ScaleState::default(),
            metrics_fn: None,
            scale_fn: None,
        }
    }

    /// Set the callback used to read pool metrics.
    pub fn with_metrics_fn(mut self, f: MetricsCallback) -> Self {
        self.metrics_fn = Some(f);
        self
    }

    /// Set the callback used to perform scaling.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    pub fn settings(&self) -> &AutoscaleSettings {
        &self.settings
    }

    /// Decide whether the pool should be resized, given its latest metrics.
    pub fn evaluate(&mut self, metrics: &PoolMetrics) -> ScaleDecision {
        self.evaluate_at(metrics, epoch_secs())
    }

    fn evaluate_at(&mut self, metrics: &PoolMetrics, now: u64) -> ScaleDecision {
        let s = &self.settings;
        let current = metrics.containers;
        let value = metric_value(s.metric, metrics);

        let desired = if current < s.min_containers || current > s.max_containers {
            current.clamp(s.min_containers, s.max_containers)
        } else if s.metric == ScalingMetric::Containers {
            let low = s.lower_bound.max(0.0).ceil() as u32;
            let high = (s.upper_bound.max(0.0).floor() as u32).max(low);
            current
                .clamp(low, high)
                .clamp(s.min_containers, s.max_containers)
        } else if value > s.upper_bound && current > 0 {
            let ratio = value / s.upper_bound.max(f64::EPSILON);
            let scaled = (f64::from(current) * ratio).ceil() as u32;
            scaled.max(current + 1).min(s.max_containers)
        } else if value < s.lower_bound && current > s.min_containers {
            let ratio = value / s.lower_bound;
            let scaled = (f64::from(current) * ratio).ceil() as u32;
            scaled.max(s.min_containers)
        } else {
            current
        };

        if desired > current {
            if now.saturating_sub(self.state.last_scale_up) < s.scale_up_window.as_secs() {
                debug!(from = current, to = desired, "scale up suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.state.last_scale_up = now;
            debug!(from = current, to = desired, metric = ?s.metric, value, upper = s.upper_bound, "scaling up");
            ScaleDecision::ScaleTo(desired)
        } else if desired < current {
            if now.saturating_sub(self.state.last_scale_down) < s.scale_down_window.as_secs() {
                debug!(from = current, to = desired, "scale down suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.state.last_scale_down = now;
            debug!(from = current, to = desired, metric = ?s.metric, value, lower = s.lower_bound, "scaling down");
            ScaleDecision::ScaleTo(desired)
        } else {
            ScaleDecision::NoChange
        }
    }

    /// Read metrics, decide, and run the scale callback if a resize is due.
    pub async fn evaluate_once(&mut self) -> anyhow::Result<ScaleDecision> {
        let Some(metrics_fn) = &self.metrics_fn else {
            anyhow::bail!("autoscaler has no metrics source");
        };
        let metrics = metrics_fn().await?;
        let decision = self.evaluate(&metrics);

        if let ScaleDecision::ScaleTo(target) = decision
            && let Some(scale_fn) = &self.scale_fn
            && let Err(e) = scale_fn(target).await
        {
            warn!(target, error = %e, "scaling action failed");
        }
        Ok(decision)
    }

    /// Run the autoscaler loop until `shutdown` changes.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.settings.interval;
        info!(
            interval_ms = interval.as_millis() as u64,
            metric = ?self.settings.metric,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_once().await {
                        error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn metric_value(metric: ScalingMetric, metrics: &PoolMetrics) -> f64 {
    match metric {
        ScalingMetric::AverageCpu => metrics.average_cpu,
        ScalingMetric::TotalHeap => metrics.total_heap_bytes as f64,
        ScalingMetric::Containers => f64::from(metrics.containers),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
