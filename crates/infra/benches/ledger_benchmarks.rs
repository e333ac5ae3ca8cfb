use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use gemledger_consignments::ConsignmentItem;
use gemledger_core::{AggregateId, CustomerId, ExpectedVersion, OperatorId};
use gemledger_events::{EventEnvelope, InMemoryEventBus};
use gemledger_infra::event_store::{EventStore, InMemoryEventStore, StreamAppend, UncommittedEvent};
use gemledger_infra::projections::{GemCatalogEntry, GemCatalogProjection};
use gemledger_infra::read_model::InMemoryReadModelStore;
use gemledger_infra::{InventoryLedger, LedgerConfig, NewConsignment, NewGem};
use gemledger_inventory::{
    GemAttributes, GemEvent, GemId, GemOrigin, GemRegistered, GemReserved, StockId,
    GEM_AGGREGATE_TYPE,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

fn ledger() -> InventoryLedger<InMemoryEventStore, Bus> {
    InventoryLedger::new(
        InMemoryEventStore::new(),
        Arc::new(InMemoryEventBus::new()),
        LedgerConfig::default(),
    )
}

fn new_gem(quantity: u32) -> NewGem {
    NewGem {
        stock_id: None,
        attributes: GemAttributes {
            gem_type: "Sapphire".to_string(),
            ..GemAttributes::default()
        },
        carat: Decimal::from(quantity),
        cost: dec!(250),
        price: dec!(600),
        quantity,
    }
}

fn bench_ledger_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_operations");

    group.bench_function("register_gem", |b| {
        let ledger = ledger();
        let operator = OperatorId::new();
        b.iter(|| {
            ledger.register_gem(black_box(new_gem(1)), operator).unwrap();
        });
    });

    for lines in [1usize, 5, 20] {
        group.bench_with_input(
            BenchmarkId::new("consign_and_return", lines),
            &lines,
            |b, &lines| {
                let ledger = ledger();
                let operator = OperatorId::new();
                let gems: Vec<GemId> = (0..lines)
                    .map(|_| ledger.register_gem(new_gem(2), operator).unwrap().id_typed())
                    .collect();

                b.iter(|| {
                    let items = gems
                        .iter()
                        .map(|g| ConsignmentItem::new(*g, 1, dec!(0.5), dec!(900)))
                        .collect();
                    let consignment = ledger
                        .create_consignment(
                            NewConsignment {
                                customer_id: CustomerId::new(),
                                items,
                                return_date: Utc::now() + Duration::days(7),
                            },
                            operator,
                        )
                        .unwrap();
                    ledger
                        .return_consignment(black_box(consignment.id_typed()), operator)
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

fn registered(gem_id: GemId) -> GemEvent {
    GemEvent::GemRegistered(GemRegistered {
        gem_id,
        stock_id: StockId::generate("BEN").unwrap(),
        attributes: GemAttributes {
            gem_type: "Ruby".to_string(),
            ..GemAttributes::default()
        },
        carat: dec!(100),
        cost: dec!(10),
        price: dec!(20),
        quantity: 100,
        origin: GemOrigin::Manual,
        operator: OperatorId::new(),
        occurred_at: Utc::now(),
    })
}

fn reserved(gem_id: GemId) -> GemEvent {
    GemEvent::GemReserved(GemReserved {
        gem_id,
        consignment_id: AggregateId::new(),
        quantity: 1,
        carat: dec!(0.1),
        operator: OperatorId::new(),
        occurred_at: Utc::now(),
    })
}

fn uncommitted(gem_id: GemId, event: &GemEvent) -> UncommittedEvent {
    UncommittedEvent::from_typed(gem_id.0, GEM_AGGREGATE_TYPE, uuid::Uuid::now_v7(), event).unwrap()
}

fn bench_append_batch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_batch_throughput");

    for streams in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(streams as u64));
        group.bench_with_input(BenchmarkId::new("new_streams", streams), &streams, |b, &n| {
            let store = InMemoryEventStore::new();
            b.iter(|| {
                let batch: Vec<StreamAppend> = (0..n)
                    .map(|_| {
                        let gem_id = GemId::new(AggregateId::new());
                        StreamAppend::new(
                            ExpectedVersion::Exact(0),
                            vec![uncommitted(gem_id, &registered(gem_id))],
                        )
                    })
                    .collect();
                black_box(store.append_batch(batch).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_catalog_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("gem_catalog_rebuild");

    for event_count in [10u64, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("rebuild_from_events", event_count),
            &event_count,
            |b, &count| {
                let store = InMemoryEventStore::new();
                let gem_id = GemId::new(AggregateId::new());
                store
                    .append(vec![uncommitted(gem_id, &registered(gem_id))], ExpectedVersion::Exact(0))
                    .unwrap();
                for i in 1..count {
                    store
                        .append(vec![uncommitted(gem_id, &reserved(gem_id))], ExpectedVersion::Exact(i))
                        .unwrap();
                }
                let envelopes: Vec<_> = store
                    .load_stream(gem_id.0)
                    .unwrap()
                    .iter()
                    .map(|e| e.to_envelope())
                    .collect();

                let projection: GemCatalogProjection<
                    Arc<InMemoryReadModelStore<GemId, GemCatalogEntry>>,
                > = GemCatalogProjection::new(Arc::new(InMemoryReadModelStore::new()));

                b.iter(|| {
                    projection.rebuild_from_scratch(black_box(envelopes.clone())).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ledger_operations,
    bench_append_batch_throughput,
    bench_catalog_rebuild
);
criterion_main!(benches);
