/// Error types for the donation fulfillment engine.
///
/// Every engine operation returns a typed `FulfillmentError` to its caller.
/// "No compatible inventory" is not an error: allocator lookups return
/// `Option::None` for that branch.

use strum::Display;
use thiserror::Error;

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EntityKind {
    #[strum(serialize = "demand")]
    Demand,
    #[strum(serialize = "workflow")]
    Workflow,
    #[strum(serialize = "inventory unit")]
    InventoryUnit,
    #[strum(serialize = "appointment request")]
    AppointmentRequest,
    #[strum(serialize = "capacity slot")]
    CapacitySlot,
    #[strum(serialize = "donor")]
    Donor,
    #[strum(serialize = "location")]
    Location,
    #[strum(serialize = "blood type")]
    BloodType,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FulfillmentError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    /// A transition was attempted from an incompatible status.
    #[error("cannot {action} {entity} {id} while it is {status}")]
    InvalidState {
        entity: EntityKind,
        id: String,
        action: &'static str,
        status: String,
    },

    /// A concurrent mutation won, or a shared resource is exhausted.
    #[error("conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: EntityKind,
        id: String,
        reason: String,
    },

    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl FulfillmentError {
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        FulfillmentError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        entity: EntityKind,
        id: impl ToString,
        action: &'static str,
        status: impl ToString,
    ) -> Self {
        FulfillmentError::InvalidState {
            entity,
            id: id.to_string(),
            action,
            status: status.to_string(),
        }
    }

    pub fn conflict(entity: EntityKind, id: impl ToString, reason: impl Into<String>) -> Self {
        FulfillmentError::Conflict {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        FulfillmentError::Validation(message.into())
    }

    /// HTTP-equivalent status code a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FulfillmentError::NotFound { .. } => 404,
            FulfillmentError::InvalidState { .. } | FulfillmentError::Validation(_) => 400,
            FulfillmentError::Conflict { .. } => 409,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FulfillmentError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;
