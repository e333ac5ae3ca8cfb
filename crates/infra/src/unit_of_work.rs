//! Multi-aggregate atomic writes.
//!
//! A `UnitOfWork` loads aggregates, lets the caller run commands against them in
//! memory (`Tracked::execute` decides and applies in one step, so several commands
//! against the same gem fold in order), then stages the resulting events per stream.
//! `commit` hands every staged stream to `EventStore::append_batch` with
//! `ExpectedVersion::Exact(loaded version)` and publishes only after the batch
//! succeeded. Dropping an uncommitted unit discards everything.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use gemledger_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use gemledger_events::{Event, EventBus, EventEnvelope};

use crate::command_dispatcher::{load_aggregate, publish_committed};
use crate::error::LedgerError;
use crate::event_store::{EventStore, StoredEvent, StreamAppend, UncommittedEvent};

/// An aggregate loaded into a unit of work, with the events decided so far.
#[derive(Debug, Clone)]
pub struct Tracked<A: Aggregate> {
    aggregate_id: AggregateId,
    aggregate_type: &'static str,
    state: A,
    loaded_version: u64,
    pending: Vec<A::Event>,
}

impl<A> Tracked<A>
where
    A: Aggregate<Error = DomainError>,
{
    /// State including every event executed so far.
    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    /// Decide and apply a command. On error the tracked state is unchanged.
    pub fn execute(&mut self, command: &A::Command) -> Result<(), LedgerError> {
        let events = self.state.handle(command)?;
        for e in &events {
            self.state.apply(e);
        }
        self.pending.extend(events);
        Ok(())
    }
}

/// Staged writes across several streams, committed together or not at all.
pub struct UnitOfWork<'a, S: ?Sized> {
    store: &'a S,
    appends: Vec<StreamAppend>,
}

impl<'a, S> UnitOfWork<'a, S>
where
    S: EventStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            appends: Vec::new(),
        }
    }

    /// Load an aggregate for tracking. A missing stream yields the empty aggregate at version 0.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Tracked<A>, LedgerError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let (state, loaded_version) =
            load_aggregate(self.store, aggregate_id, aggregate_type, make_aggregate)?;
        Ok(Tracked {
            aggregate_id,
            aggregate_type,
            state,
            loaded_version,
            pending: Vec::new(),
        })
    }

    /// Stage a tracked aggregate's pending events. Untouched aggregates stage nothing.
    pub fn stage<A>(&mut self, tracked: Tracked<A>) -> Result<A, LedgerError>
    where
        A: Aggregate,
        A::Event: Event + Serialize,
    {
        if !tracked.pending.is_empty() {
            let events = serialize(tracked.aggregate_id, tracked.aggregate_type, &tracked.pending)?;
            self.appends.push(StreamAppend::new(
                ExpectedVersion::Exact(tracked.loaded_version),
                events,
            ));
        }
        Ok(tracked.state)
    }

    /// Stage events that open a stream which must not exist yet.
    pub fn stage_new_stream<E>(
        &mut self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        events: &[E],
    ) -> Result<(), LedgerError>
    where
        E: Event + Serialize,
    {
        let events = serialize(aggregate_id, aggregate_type, events)?;
        self.appends
            .push(StreamAppend::new(ExpectedVersion::Exact(0), events));
        Ok(())
    }

    pub fn staged_streams(&self) -> usize {
        self.appends.len()
    }

    /// Append every staged stream atomically, then publish.
    pub fn commit<B>(self, bus: &B) -> Result<Vec<StoredEvent>, LedgerError>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
    {
        if self.appends.is_empty() {
            return Ok(vec![]);
        }
        let committed = self.store.append_batch(self.appends)?;
        publish_committed(bus, &committed)?;
        Ok(committed)
    }
}

fn serialize<E>(
    aggregate_id: AggregateId,
    aggregate_type: &'static str,
    events: &[E],
) -> Result<Vec<UncommittedEvent>, LedgerError>
where
    E: Event + Serialize,
{
    events
        .iter()
        .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal_macros::dec;

    use gemledger_core::{AggregateRoot, OperatorId};
    use gemledger_events::InMemoryEventBus;
    use gemledger_inventory::{
        Gem, GemAttributes, GemCommand, GemId, GemOrigin, RegisterGem, ReserveForConsignment,
        StockId, GEM_AGGREGATE_TYPE,
    };

    use super::*;
    use crate::event_store::InMemoryEventStore;

    fn register(gem_id: GemId, quantity: u32) -> GemCommand {
        GemCommand::RegisterGem(RegisterGem {
            gem_id,
            stock_id: StockId::generate("UOW").unwrap(),
            attributes: GemAttributes {
                gem_type: "Sapphire".to_string(),
                ..GemAttributes::default()
            },
            carat: dec!(3.0),
            cost: dec!(100),
            price: dec!(200),
            quantity,
            origin: GemOrigin::Manual,
            operator: OperatorId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn reserve(gem_id: GemId, quantity: u32) -> GemCommand {
        GemCommand::ReserveForConsignment(ReserveForConsignment {
            gem_id,
            consignment_id: AggregateId::new(),
            quantity,
            carat: dec!(1.0),
            operator: OperatorId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn load_gem(uow: &UnitOfWork<'_, InMemoryEventStore>, gem_id: GemId) -> Tracked<Gem> {
        uow.load(gem_id.0, GEM_AGGREGATE_TYPE, |id| Gem::empty(GemId::new(id)))
            .unwrap()
    }

    #[test]
    fn commands_on_one_gem_fold_in_order() {
        let store = InMemoryEventStore::new();
        let bus: InMemoryEventBus<EventEnvelope<JsonValue>> = InMemoryEventBus::new();
        let gem_id = GemId::new(AggregateId::new());

        let mut uow = UnitOfWork::new(&store);
        let mut gem = load_gem(&uow, gem_id);
        gem.execute(&register(gem_id, 2)).unwrap();
        gem.execute(&reserve(gem_id, 1)).unwrap();
        gem.execute(&reserve(gem_id, 1)).unwrap();
        assert!(gem.execute(&reserve(gem_id, 1)).is_err());
        let state = uow.stage(gem).unwrap();
        assert_eq!(state.in_stock(), 0);
        assert_eq!(state.reserved(), 2);

        let committed = uow.commit(&bus).unwrap();
        assert_eq!(committed.len(), 3);
        assert_eq!(store.load_stream(gem_id.0).unwrap().len(), 3);
    }

    #[test]
    fn stale_unit_fails_without_partial_writes() {
        let store = InMemoryEventStore::new();
        let bus: InMemoryEventBus<EventEnvelope<JsonValue>> = InMemoryEventBus::new();
        let gem_id = GemId::new(AggregateId::new());
        let other_id = GemId::new(AggregateId::new());

        let mut setup = UnitOfWork::new(&store);
        let mut gem = load_gem(&setup, gem_id);
        gem.execute(&register(gem_id, 2)).unwrap();
        setup.stage(gem).unwrap();
        setup.commit(&bus).unwrap();

        // Two writers load the same version; the second to commit loses.
        let mut first = UnitOfWork::new(&store);
        let mut a = load_gem(&first, gem_id);
        a.execute(&reserve(gem_id, 1)).unwrap();
        first.stage(a).unwrap();

        let mut second = UnitOfWork::new(&store);
        let mut b = load_gem(&second, gem_id);
        b.execute(&reserve(gem_id, 1)).unwrap();
        second.stage(b).unwrap();
        let mut other = load_gem(&second, other_id);
        other.execute(&register(other_id, 1)).unwrap();
        second.stage(other).unwrap();

        first.commit(&bus).unwrap();
        let err = second.commit(&bus).unwrap_err();
        assert!(err.is_conflict());
        assert!(store.load_stream(other_id.0).unwrap().is_empty());

        let (reloaded, version) =
            load_aggregate(&store, gem_id.0, GEM_AGGREGATE_TYPE, |id| Gem::empty(GemId::new(id)))
                .unwrap();
        assert_eq!(version, 2);
        assert_eq!(reloaded.reserved(), 1);
        assert_eq!(reloaded.version(), 2);
    }

    #[test]
    fn new_stream_must_not_exist() {
        let store = InMemoryEventStore::new();
        let bus: InMemoryEventBus<EventEnvelope<JsonValue>> = InMemoryEventBus::new();
        let gem_id = GemId::new(AggregateId::new());
        let events = Gem::empty(gem_id).handle(&register(gem_id, 1)).unwrap();

        let mut uow = UnitOfWork::new(&store);
        uow.stage_new_stream(gem_id.0, GEM_AGGREGATE_TYPE, &events).unwrap();
        uow.commit(&bus).unwrap();

        let mut again = UnitOfWork::new(&store);
        again.stage_new_stream(gem_id.0, GEM_AGGREGATE_TYPE, &events).unwrap();
        assert!(again.commit(&bus).unwrap_err().is_conflict());
    }

    #[test]
    fn commit_publishes_after_append() {
        let store = InMemoryEventStore::new();
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let gem_id = GemId::new(AggregateId::new());

        let mut uow = UnitOfWork::new(&store);
        let mut gem = load_gem(&uow, gem_id);
        gem.execute(&register(gem_id, 1)).unwrap();
        uow.stage(gem).unwrap();
        assert_eq!(uow.staged_streams(), 1);
        uow.commit(&bus).unwrap();

        let envelopes = sub.drain();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].aggregate_type(), GEM_AGGREGATE_TYPE);
    }
}
