//! Append-only event store boundary.
//!
//! Streams are keyed by aggregate id. Multi-stream writes go through
//! `EventStore::append_batch`, which commits every stream of a unit of work or none.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
