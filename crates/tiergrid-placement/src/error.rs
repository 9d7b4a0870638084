//! Placement error types.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// Growing the machine tier left some containers without a target.
    #[error("no capacity available: placed {placed} of {requested}")]
    NoCapacityAvailable { requested: u32, placed: u32 },

    #[error("machine tier growth failed: {0}")]
    Grow(#[source] anyhow::Error),
}
