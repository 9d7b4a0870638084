//! tiergrid-location — dynamic location registry.
//!
//! A dynamic location says "this logical entity is backed by a live
//! physical resource". The registry enforces at most one location per
//! owner and keeps the owner's location attribute in step with the set
//! of registered locations.
//!
//! # Hierarchy
//!
//! ```text
//! tiergrid-<pool>                         (Pool)
//!   ├── tiergrid-<pool>-<machine>         (Machine)
//!   │     ├── ...-<machine>-<container>   (Container)
//!   │     └── ...
//!   └── ...
//! ```
//!
//! Owners are referenced by id only; a location never keeps its owner
//! alive.

pub mod error;
pub mod registry;

pub use error::{LocationError, LocationResult};
pub use registry::{DynamicLocation, DynamicallyLocated, LocationKind, LocationRegistry, LocationSpec};
