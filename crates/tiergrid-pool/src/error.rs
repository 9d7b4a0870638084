//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use tiergrid_core::{ContainerId, EntityId, MachineId};
use tiergrid_location::LocationError;
use tiergrid_placement::PlacementError;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The machine is full. Callers treat this as "try elsewhere".
    #[error("machine {machine} has no spare capacity")]
    CapacityExhausted { machine: MachineId },

    #[error("pool {pool} made no progress towards {desired} containers (actual {actual}): {}", .causes.join("; "))]
    NoCapacityAvailable {
        pool: EntityId,
        desired: u32,
        actual: u32,
        causes: Vec<String>,
    },

    #[error("machine tier of pool {pool} is at its limit of {max} machines")]
    MachineTierExhausted { pool: EntityId, max: u32 },

    #[error("machine not found: {0}")]
    MachineNotFound(MachineId),

    #[error("machine not accepting containers: {0}")]
    MachineUnavailable(MachineId),

    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("{operation} timed out after {deadline:?}")]
    Timeout { operation: String, deadline: Duration },

    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    #[error("host driver error: {0:#}")]
    Driver(#[from] anyhow::Error),

    #[error("location error: {0}")]
    Location(#[from] LocationError),

    #[error("placement error: {0}")]
    Placement(PlacementError),
}

impl From<PlacementError> for PoolError {
    /// Unwraps pool errors that travelled through the machine-tier grower.
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::Grow(inner) => match inner.downcast::<PoolError>() {
                Ok(pool) => pool,
                Err(other) => PoolError::Placement(PlacementError::Grow(other)),
            },
            other => PoolError::Placement(other),
        }
    }
}

impl PoolError {
    /// Errors that a fresh placement snapshot may avoid.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::CapacityExhausted { .. }
                | PoolError::MachineUnavailable(_)
                | PoolError::MachineNotFound(_)
        )
    }
}
