#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use gemledger_consignments::{Consignment, ConsignmentItem};
use gemledger_core::{CustomerId, OperatorId};
use gemledger_events::{EventEnvelope, InMemoryEventBus};
use gemledger_infra::event_store::InMemoryEventStore;
use gemledger_infra::{InventoryLedger, LedgerConfig, NewConsignment, NewGem, NewInvoice};
use gemledger_inventory::{Gem, GemAttributes, GemId};
use gemledger_invoicing::{Invoice, InvoiceItem};

pub type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type Ledger = InventoryLedger<InMemoryEventStore, Bus>;

pub fn ledger() -> (Ledger, Bus) {
    gemledger_observability::init_for_tests();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let ledger = InventoryLedger::new(InMemoryEventStore::new(), bus.clone(), LedgerConfig::default());
    (ledger, bus)
}

pub fn operator() -> OperatorId {
    OperatorId::new()
}

pub fn new_gem(gem_type: &str, quantity: u32, carat: Decimal, cost: Decimal, price: Decimal) -> NewGem {
    NewGem {
        stock_id: None,
        attributes: GemAttributes {
            gem_type: gem_type.to_string(),
            ..GemAttributes::default()
        },
        carat,
        cost,
        price,
        quantity,
    }
}

pub fn register(ledger: &Ledger, quantity: u32, carat: Decimal) -> anyhow::Result<Gem> {
    let gem = ledger.register_gem(
        new_gem("Sapphire", quantity, carat, Decimal::from(500), Decimal::from(1200)),
        operator(),
    )?;
    Ok(gem)
}

/// Consign `(gem, quantity, carat)` lines at a flat price per carat.
pub fn consign(ledger: &Ledger, lines: &[(GemId, u32, Decimal)]) -> anyhow::Result<Consignment> {
    let items = lines
        .iter()
        .map(|(gem_id, quantity, carat)| {
            ConsignmentItem::new(*gem_id, *quantity, *carat, Decimal::from(800))
        })
        .collect();
    let consignment = ledger.create_consignment(
        NewConsignment {
            customer_id: CustomerId::new(),
            items,
            return_date: Utc::now() + Duration::days(14),
        },
        operator(),
    )?;
    Ok(consignment)
}

/// Sell `(gem, quantity, carat)` lines straight out of stock.
pub fn sell(ledger: &Ledger, lines: &[(GemId, u32, Decimal)]) -> anyhow::Result<Invoice> {
    let items = lines
        .iter()
        .map(|(gem_id, quantity, carat)| InvoiceItem::new(*gem_id, *quantity, *carat, Decimal::from(900)))
        .collect();
    let invoice = ledger.create_invoice(
        NewInvoice {
            customer_id: CustomerId::new(),
            items,
            due_date: Utc::now() + Duration::days(30),
        },
        operator(),
    )?;
    Ok(invoice)
}

pub fn due_date() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::days(30)
}

pub fn total_units(gem: &Gem) -> u64 {
    gem.counters().total()
}
