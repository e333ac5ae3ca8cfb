//! Error surface of the inventory ledger.

use thiserror::Error;

use gemledger_core::DomainError;

use crate::event_store::EventStoreError;

/// Failure of a ledger operation. Nothing is persisted when one is returned, except
/// for `Publish`, which is raised after the commit succeeded.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Bad input, overcommitted quantity or carat, or an imbalanced split.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced gem, consignment or invoice does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification, a record in the wrong state, or a counter that
    /// would go negative.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The event store rejected or failed the write.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A stored payload could not be decoded into its event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    /// Publication failed after a successful commit (at-least-once; republish is safe).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, LedgerError::Validation(_))
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                LedgerError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) | DomainError::Conflict(msg) => {
                LedgerError::Conflict(msg)
            }
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Unauthorized => {
                LedgerError::Validation("operator is not authorized".to_string())
            }
        }
    }
}

impl From<EventStoreError> for LedgerError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => LedgerError::Conflict(msg),
            EventStoreError::Publish(msg) => LedgerError::Publish(msg),
            other => LedgerError::Persistence(other.to_string()),
        }
    }
}
