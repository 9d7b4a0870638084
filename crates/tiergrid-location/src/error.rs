//! Location registry error types.

use thiserror::Error;

use tiergrid_core::{EntityId, LocationId};

pub type LocationResult<T> = Result<T, LocationError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("entity {owner} already has a live location: {location}")]
    AlreadyExists { owner: EntityId, location: LocationId },

    #[error("location name already registered: {0}")]
    DuplicateName(LocationId),

    #[error("parent location not registered: {0}")]
    ParentNotFound(LocationId),

    /// Attribute and registry disagree. Healed on delete, never returned
    /// from `delete_location`.
    #[error("location inconsistency for {owner}: {detail}")]
    Inconsistent { owner: EntityId, detail: String },
}
