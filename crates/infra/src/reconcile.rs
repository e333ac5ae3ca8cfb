//! Status consistency checker.
//!
//! Quantity counters are the only authority for a gem's status. This module derives
//! the status a second way, from which records reference the gem, and reports every
//! gem where the recorded status, the counter-derived status and the reference-derived
//! status disagree. It never writes.

use std::collections::HashMap;

use serde::Serialize;

use gemledger_consignments::Consignment;
use gemledger_inventory::{Gem, GemId, GemStatus, QuantityCounters, StockId};
use gemledger_invoicing::Invoice;

/// One gem whose status sources disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusDiscrepancy {
    pub gem_id: GemId,
    pub stock_id: Option<StockId>,
    /// Status currently stored on the gem (may be an administrative override).
    pub recorded: GemStatus,
    /// Status implied by the quantity counters and remaining carat.
    pub from_counters: GemStatus,
    /// Status implied by the quantities on invoices and pending consignments.
    pub from_references: GemStatus,
}

impl StatusDiscrepancy {
    /// The stored status differs from the counters, typically after `override_status`.
    pub fn is_override(&self) -> bool {
        self.recorded != self.from_counters
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub scanned: usize,
    pub discrepancies: Vec<StatusDiscrepancy>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn discrepancy_for(&self, gem_id: GemId) -> Option<&StatusDiscrepancy> {
        self.discrepancies.iter().find(|d| d.gem_id == gem_id)
    }
}

/// Compare every gem's status sources.
///
/// The reference-derived status rebuilds the counters from the records that point at
/// the gem: units on pending consignments are reserved, units on invoices are sold
/// (cancelling an invoice does not return stock), the rest of the gem's units are in
/// stock. Retired gems are `Sold`. Remaining carat applies as for the live counters.
pub fn reconcile(gems: &[Gem], consignments: &[Consignment], invoices: &[Invoice]) -> ReconciliationReport {
    let mut referenced: HashMap<GemId, (u32, u32)> = HashMap::new();
    for consignment in consignments.iter().filter(|c| c.is_pending()) {
        for item in consignment.items() {
            referenced.entry(item.gem_id).or_default().0 += item.quantity;
        }
    }
    for invoice in invoices.iter().filter(|i| i.is_created()) {
        for item in invoice.items() {
            referenced.entry(item.gem_id).or_default().1 += item.quantity;
        }
    }

    let mut report = ReconciliationReport::default();
    for gem in gems.iter().filter(|g| g.is_created()) {
        report.scanned += 1;

        let gem_id = gem.id_typed();
        let from_references = if gem.is_retired() {
            GemStatus::Sold
        } else {
            let (reserved, sold) = referenced.get(&gem_id).copied().unwrap_or_default();
            let total = u32::try_from(gem.counters().total()).unwrap_or(u32::MAX);
            let counters = QuantityCounters {
                in_stock: total.saturating_sub(reserved).saturating_sub(sold),
                reserved,
                sold,
            };
            GemStatus::derive(counters, gem.carat())
        };
        let recorded = gem.status();
        let from_counters = gem.derived_status();

        if recorded != from_counters || from_counters != from_references {
            report.discrepancies.push(StatusDiscrepancy {
                gem_id,
                stock_id: gem.stock_id().cloned(),
                recorded,
                from_counters,
                from_references,
            });
        }
    }

    report
}
