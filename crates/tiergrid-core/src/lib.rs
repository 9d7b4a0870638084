//! tiergrid-core — shared types for the two-tier elastic pool.
//!
//! Holds the identifiers and flag maps passed between crates, the
//! process-wide name sequence, pool metrics, and the `tiergrid.toml`
//! parser that resolves into [`PoolSettings`] and [`AutoscaleSettings`].

pub mod config;
pub mod naming;
pub mod types;

pub use config::{
    AutoscaleSettings, BalancerKind, EmptyMachinePolicy, PoolSettings, ScalingMetric,
    TierGridConfig, Timeouts, parse_duration,
};
pub use naming::{format_name, generate_id, next_sequence};
pub use types::*;
