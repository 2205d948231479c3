//! Error types.
//!
//! Three layers: [`PersistenceError`] from the storage adapters,
//! [`ReservationError`] from the reservation state machine and
//! [`AlertError`] from alert generation and the alert mutators. Each exposes
//! `is_retryable` so callers can tell a transient failure (safe to retry the
//! whole operation) from one that retrying cannot fix.

use crate::types::UnknownVariant;
use thiserror::Error;

/// Errors raised by storage adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Row does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Table or entity name
        entity: &'static str,
        /// Key that was looked up
        id: String,
    },

    /// A conditional write found the row in an unexpected state
    #[error("Conditional write on {entity} {id} rejected: {reason}")]
    Conflict {
        /// Table or entity name
        entity: &'static str,
        /// Key that was written
        id: String,
        /// What the row looked like instead
        reason: String,
    },

    /// The store could not be reached; nothing was written
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Shorthand for [`PersistenceError::NotFound`]
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`PersistenceError::Conflict`]
    #[must_use]
    pub fn conflict(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Transient failures only
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<UnknownVariant> for PersistenceError {
    fn from(err: UnknownVariant) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Errors from the reservation state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// Input rejected before anything was written
    #[error("Invalid {field}: {message}")]
    Validation {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        message: String,
    },

    /// The tool or reservation changed underneath the caller
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Referenced tool, employee or reservation does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity name
        entity: &'static str,
        /// Key that was looked up
        id: String,
    },

    /// Tool and reservation disagree and could not be brought back in line.
    ///
    /// Recorded in the violation log; needs manual reconciliation.
    #[error("Consistency violation during {operation}: {detail}")]
    ConsistencyViolation {
        /// Operation that detected it
        operation: &'static str,
        /// What was left in which state
        detail: String,
    },

    /// Transient store failure; nothing was changed and retrying is safe
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Non-transient store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl ReservationError {
    /// Shorthand for [`ReservationError::Validation`]
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Retrying the same call may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Someone has to look at the data
    #[must_use]
    pub const fn needs_review(&self) -> bool {
        matches!(self, Self::ConsistencyViolation { .. })
    }
}

impl From<PersistenceError> for ReservationError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound { entity, id } => Self::NotFound { entity, id },
            PersistenceError::Conflict { entity, id, reason } => {
                Self::Conflict(format!("{entity} {id}: {reason}"))
            }
            PersistenceError::Unavailable(msg) => Self::Unavailable(msg),
            PersistenceError::Database(msg) | PersistenceError::Corrupt(msg) => Self::Store(msg),
        }
    }
}

/// Errors from alert generation and the alert mutators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    /// Alert, tool or employee does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity name
        entity: &'static str,
        /// Key that was looked up
        id: String,
    },

    /// Underlying store failure
    #[error(transparent)]
    Store(PersistenceError),
}

impl AlertError {
    /// Retrying the same call may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            Self::NotFound { .. } => false,
        }
    }
}

impl From<PersistenceError> for AlertError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Store(other),
        }
    }
}

/// Errors from the alert feed handle
#[derive(Error, Debug)]
pub enum FeedError {
    /// The view did not reach the awaited state in time
    #[error("Timed out waiting for the alert feed")]
    Timeout,

    /// The feed was shut down
    #[error("Alert feed stopped")]
    Stopped,

    /// The reducer store rejected an action or failed to drain
    #[error(transparent)]
    Store(#[from] toolcrib_runtime::StoreError),
}
