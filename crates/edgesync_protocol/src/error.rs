//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or validating protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The entity type name is not one of the mirrored types.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// The sync direction name is not recognised.
    #[error("unknown sync direction: {0}")]
    UnknownDirection(String),

    /// An entity row failed validation.
    #[error("invalid entity {entity_id:?}: {reason}")]
    InvalidEntity {
        /// Entity ID as read from the store (may itself be the invalid part).
        entity_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A run was asked to move to a status its lifecycle does not allow.
    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Attempted target status.
        to: String,
    },
}

impl ProtocolError {
    /// Creates an invalid entity error.
    pub fn invalid_entity(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntity {
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }
}
