use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use gemledger_core::AggregateId;
use gemledger_events::EventEnvelope;
use gemledger_inventory::{
    GemEvent, GemId, GemOrigin, GemStatus, QuantityCounters, StockId, GEM_AGGREGATE_TYPE,
};

use crate::read_model::ReadModelStore;

/// Queryable gem row: counters, remaining carat and status as of the last applied event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GemCatalogEntry {
    pub gem_id: GemId,
    pub stock_id: StockId,
    pub gem_type: String,
    pub origin: GemOrigin,
    pub carat: Decimal,
    pub reserved_carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
    pub counters: QuantityCounters,
    pub status: GemStatus,
    pub retired: bool,
}

#[derive(Debug, Error)]
pub enum GemCatalogError {
    #[error("failed to deserialize gem event: {0}")]
    Deserialize(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Gem catalog projection.
///
/// Consumes published envelopes and keeps one row per gem. Envelopes from other
/// aggregate types are skipped, so the projection can sit on the shared bus.
#[derive(Debug)]
pub struct GemCatalogProjection<S>
where
    S: ReadModelStore<GemId, GemCatalogEntry>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> GemCatalogProjection<S>
where
    S: ReadModelStore<GemId, GemCatalogEntry>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, gem_id: &GemId) -> Option<GemCatalogEntry> {
        self.store.get(gem_id)
    }

    /// All rows, ordered by stock ID.
    pub fn list(&self) -> Vec<GemCatalogEntry> {
        let mut rows = self.store.list();
        rows.sort_by(|a, b| a.stock_id.cmp(&b.stock_id));
        rows
    }

    /// Rows that can still be consigned or sold.
    pub fn available(&self) -> Vec<GemCatalogEntry> {
        self.list()
            .into_iter()
            .filter(|r| !r.retired && r.status == GemStatus::InStock)
            .collect()
    }

    /// Apply a published envelope.
    ///
    /// Replays at or below the stream cursor are ignored (at-least-once delivery);
    /// a gap in the stream is an error.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), GemCatalogError> {
        if envelope.aggregate_type() != GEM_AGGREGATE_TYPE {
            return Ok(());
        }
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let Ok(mut cursors) = self.cursors.write() {
            let last = *cursors.get(&aggregate_id).unwrap_or(&0);

            if seq == 0 {
                return Err(GemCatalogError::NonMonotonicSequence { last, found: seq });
            }
            if seq <= last {
                return Ok(());
            }
            if seq != last + 1 && last != 0 {
                return Err(GemCatalogError::NonMonotonicSequence { last, found: seq });
            }

            let event: GemEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| GemCatalogError::Deserialize(e.to_string()))?;

            let gem_id = event.gem_id();
            if gem_id.0 != aggregate_id {
                return Err(GemCatalogError::StreamMismatch(
                    "event gem_id does not match envelope aggregate_id".to_string(),
                ));
            }

            if let GemEvent::GemRegistered(e) = &event {
                self.store.upsert(
                    gem_id,
                    GemCatalogEntry {
                        gem_id,
                        stock_id: e.stock_id.clone(),
                        gem_type: e.attributes.gem_type.clone(),
                        origin: e.origin,
                        carat: e.carat,
                        reserved_carat: Decimal::ZERO,
                        cost: e.cost,
                        price: e.price,
                        counters: QuantityCounters {
                            in_stock: e.quantity,
                            reserved: 0,
                            sold: 0,
                        },
                        status: GemStatus::derive(
                            QuantityCounters {
                                in_stock: e.quantity,
                                reserved: 0,
                                sold: 0,
                            },
                            e.carat,
                        ),
                        retired: false,
                    },
                );
            } else {
                let mut row = self.store.get(&gem_id).ok_or_else(|| {
                    GemCatalogError::StreamMismatch(format!("gem {gem_id} changed before registration"))
                })?;
                apply_change(&mut row, &event);
                self.store.upsert(gem_id, row);
            }

            cursors.insert(aggregate_id, seq);
        }

        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), GemCatalogError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        // Deterministic replay order: aggregate, sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

fn apply_change(row: &mut GemCatalogEntry, event: &GemEvent) {
    let c = &mut row.counters;
    match event {
        GemEvent::GemRegistered(_) => {}
        GemEvent::GemReserved(e) => {
            c.in_stock = c.in_stock.saturating_sub(e.quantity);
            c.reserved += e.quantity;
            row.carat = (row.carat - e.carat).max(Decimal::ZERO);
            row.reserved_carat += e.carat;
        }
        GemEvent::ConsignmentReleased(e) => {
            c.reserved = c.reserved.saturating_sub(e.quantity);
            c.in_stock += e.quantity;
            row.reserved_carat = (row.reserved_carat - e.carat).max(Decimal::ZERO);
            row.carat += e.carat;
        }
        GemEvent::SaleRecorded(e) => {
            if e.from_consignment {
                c.reserved = c.reserved.saturating_sub(e.quantity);
                row.reserved_carat = (row.reserved_carat - e.carat).max(Decimal::ZERO);
            } else {
                c.in_stock = c.in_stock.saturating_sub(e.quantity);
                row.carat = (row.carat - e.carat).max(Decimal::ZERO);
            }
            c.sold += e.quantity;
        }
        GemEvent::GemRetired(e) => {
            c.in_stock = 0;
            c.sold += e.consumed_quantity;
            row.retired = true;
            row.status = GemStatus::Sold;
            return;
        }
        GemEvent::StatusOverridden(e) => {
            row.status = e.status;
            return;
        }
    }
    row.status = GemStatus::derive(row.counters, row.carat);
}
