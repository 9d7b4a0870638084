//! tiergrid-autoscale — metric-range pool resizing.
//!
//! Reads [`PoolMetrics`] through a callback, compares the configured
//! metric against `[lower_bound, upper_bound]`, and asks the pool to
//! resize. Cooldown windows keep it from oscillating.
//!
//! # Scaling Algorithm
//!
//! ```text
//! value   = average_cpu | total_heap_bytes | containers
//! current = containers in the pool
//!
//! current outside [min_containers, max_containers]:
//!     ScaleTo(clamp(current))
//!
//! value > upper_bound (average_cpu, total_heap):
//!     ScaleTo(min(ceil(current * value / upper_bound), max_containers))
//!
//! value < lower_bound and current > min_containers:
//!     ScaleTo(max(ceil(current * value / lower_bound), min_containers))
//!
//! containers metric:
//!     ScaleTo(clamp(current, lower_bound, upper_bound))
//! ```
//!
//! [`PoolMetrics`]: tiergrid_core::PoolMetrics

pub mod scaler;

pub use scaler::{Autoscaler, BoxFuture, MetricsCallback, ScaleCallback, ScaleDecision};
