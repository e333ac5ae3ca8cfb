//! `gemledger-core`: shared domain building blocks.
//!
//! Identifiers, the domain error model and the aggregate contract used by every
//! ledger crate. Nothing in here performs IO.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CustomerId, OperatorId};
