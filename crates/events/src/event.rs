use chrono::{DateTime, Utc};

/// A ledger fact.
///
/// Events are immutable once committed, versioned for schema evolution, and only
/// ever appended to their stream.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "inventory.gem.reserved").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Business time of the operation that produced the event.
    fn occurred_at(&self) -> DateTime<Utc>;
}
