//! Single-aggregate command pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! Operations that touch several aggregates at once (a consignment and its gems, a
//! merge and its sources) use `UnitOfWork` instead, which shares the loading and
//! publishing helpers defined here.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use gemledger_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use gemledger_events::{EventBus, EventEnvelope};

use crate::error::LedgerError;
use crate::event_store::{EventStore, StoredEvent, UncommittedEvent};

/// Outcome of a dispatched command: the aggregate after the new events, and what was stored.
#[derive(Debug, Clone)]
pub struct Dispatched<A> {
    pub aggregate: A,
    pub committed: Vec<StoredEvent>,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - Events are persisted before publication; if the append fails nothing is published.
/// - A concurrent writer between load and append makes the append fail with
///   `LedgerError::Conflict`. No automatic retry.
/// - If publication fails after the append, `LedgerError::Publish` is returned; the
///   events are already durable (at-least-once delivery).
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command against one aggregate stream.
    ///
    /// `make_aggregate` builds the empty instance that history is replayed onto
    /// (e.g. `Invoice::empty`). A command that decides no events returns the current
    /// state with an empty `committed`.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, LedgerError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: gemledger_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_type: String = aggregate_type.into();

        // 1) + 2) Load and rehydrate
        let (mut aggregate, loaded_version) =
            load_aggregate(&self.store, aggregate_id, &aggregate_type, make_aggregate)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(Dispatched {
                aggregate,
                committed: vec![],
            });
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, aggregate_type.clone(), Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(loaded_version))?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        // 5) Publish committed events (after append)
        publish_committed(&self.bus, &committed)?;

        Ok(Dispatched {
            aggregate,
            committed,
        })
    }
}

/// Publish committed events in commit order.
pub(crate) fn publish_committed<B>(bus: &B, committed: &[StoredEvent]) -> Result<(), LedgerError>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    for stored in committed {
        bus.publish(stored.to_envelope())
            .map_err(|e| LedgerError::Publish(format!("{e:?}")))?;
    }
    Ok(())
}

/// Load a stream and replay it onto a fresh aggregate.
///
/// Returns the aggregate and the stream version to expect on the next append.
/// A stream owned by another aggregate type yields the empty aggregate, so the
/// caller's existence checks report the id as not found.
pub(crate) fn load_aggregate<A, S>(
    store: &S,
    aggregate_id: AggregateId,
    aggregate_type: &str,
    make_aggregate: impl FnOnce(AggregateId) -> A,
) -> Result<(A, u64), LedgerError>
where
    S: EventStore + ?Sized,
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let history = store.load_stream(aggregate_id)?;
    validate_loaded_stream(aggregate_id, &history)?;
    let version = stream_version(&history);

    let mut aggregate = make_aggregate(aggregate_id);
    if history.first().is_some_and(|e| e.aggregate_type != aggregate_type) {
        return Ok((aggregate, version));
    }
    apply_history(&mut aggregate, &history)?;
    Ok((aggregate, version))
}

/// Rebuild every aggregate stored under `aggregate_type`, in stream creation order.
pub(crate) fn load_all<A, S>(
    store: &S,
    aggregate_type: &str,
    make_aggregate: impl Fn(AggregateId) -> A,
) -> Result<Vec<A>, LedgerError>
where
    S: EventStore + ?Sized,
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let events = store.load_by_aggregate_type(aggregate_type)?;

    let mut aggregates: Vec<(AggregateId, A)> = Vec::new();
    for stored in events {
        let ev: A::Event = decode(&stored)?;
        let same_stream = aggregates
            .last()
            .is_some_and(|(id, _)| *id == stored.aggregate_id);
        if !same_stream {
            aggregates.push((stored.aggregate_id, make_aggregate(stored.aggregate_id)));
        }
        if let Some((_, aggregate)) = aggregates.last_mut() {
            aggregate.apply(&ev);
        }
    }

    Ok(aggregates.into_iter().map(|(_, a)| a).collect())
}

pub(crate) fn decode<E: DeserializeOwned>(stored: &StoredEvent) -> Result<E, LedgerError> {
    serde_json::from_value(stored.payload.clone()).map_err(|e| {
        LedgerError::Deserialize(format!(
            "{} #{} ({}): {e}",
            stored.aggregate_id, stored.sequence_number, stored.event_type
        ))
    })
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), LedgerError> {
    // The stream must belong to this aggregate and be strictly increasing.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(LedgerError::Persistence(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(LedgerError::Persistence(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), LedgerError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = decode(stored)?;
        aggregate.apply(&ev);
    }
    Ok(())
}
