//! Error types for the ledger.

use crate::hash::EventId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a ledger operation.
///
/// Event validation problems are not errors in this sense: they are reported
/// through [`crate::EventValidation`] and never returned as `Err`.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Corrupt ledger storage: {0}")]
    Corrupt(String),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// A single reason an externally sourced event was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Invalid signature for event {0}")]
    InvalidSignature(EventId),

    #[error("Unknown author key: {0}")]
    UnknownAuthorKey(String),

    #[error("Parent not found: {0}")]
    ParentNotFound(EventId),

    #[error("Causality violation: event is not later than parent {0}")]
    CausalityViolation(EventId),

    #[error("Event ID mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: EventId, computed: EventId },

    #[error("Canonical serialization failed: {0}")]
    Serialization(String),
}
