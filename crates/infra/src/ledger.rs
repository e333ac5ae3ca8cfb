//! The inventory ledger: the only writer of gem quantity counters.
//!
//! Each operation loads the records it touches, runs their commands in memory and
//! commits everything through one `UnitOfWork`. Any rejection (validation, overcommit,
//! wrong state, stale version) leaves the store untouched. Committed events are
//! published after the commit.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use gemledger_consignments::{
    Consignment, ConsignmentCommand, ConsignmentId, ConsignmentItem, CreateConsignment,
    DeactivateConsignment, DeleteConsignment, MarkPurchased, MarkReturned,
    CONSIGNMENT_AGGREGATE_TYPE,
};
use gemledger_core::{AggregateId, CustomerId, OperatorId};
use gemledger_events::{EventBus, EventEnvelope};
use gemledger_inventory::{
    merged_valuation, validate_split, Gem, GemAttributes, GemCommand, GemId, GemOrigin, GemRef,
    GemStatus, MergeSplitEvent, MergeSplitKind, MergeSplitRecorded, OverrideStatus, RecordSale,
    RegisterGem, ReleaseConsignment, ReleaseOutcome, ReserveForConsignment,
    RetireForMergeOrSplit, SplitPortion, StockId, StockIdClaimed, StockIdEvent, Valuation,
    GEM_AGGREGATE_TYPE, MERGE_SPLIT_AGGREGATE_TYPE, STOCK_ID_AGGREGATE_TYPE,
};
use gemledger_invoicing::{
    CancelInvoice, CreateInvoice, Invoice, InvoiceCommand, InvoiceId, InvoiceItem, InvoiceSource,
    MarkOverdue, MarkSent, RecordPayment, INVOICE_AGGREGATE_TYPE,
};

use crate::command_dispatcher::{decode, load_aggregate, load_all, CommandDispatcher};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::event_store::EventStore;
use crate::reconcile::{reconcile, ReconciliationReport};
use crate::unit_of_work::{Tracked, UnitOfWork};

/// A gem entered by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGem {
    /// Generated from the configured prefix when absent.
    pub stock_id: Option<StockId>,
    pub attributes: GemAttributes,
    pub carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsignment {
    pub customer_id: CustomerId,
    pub items: Vec<ConsignmentItem>,
    pub return_date: DateTime<Utc>,
}

/// A direct sale out of stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub customer_id: CustomerId,
    pub items: Vec<InvoiceItem>,
    pub due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub sources: Vec<GemId>,
    /// Stock code of the merged gem; generated when absent.
    pub stock_id: Option<StockId>,
    /// Descriptors of the merged gem; copied from the first source when absent.
    pub attributes: Option<GemAttributes>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRequest {
    pub source: GemId,
    pub portions: Vec<SplitPortion>,
    pub notes: Option<String>,
}

/// Result of a merge or split: the audit record plus the gems on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSplitOutcome {
    pub record: MergeSplitRecorded,
    pub retired: Vec<Gem>,
    pub created: Vec<Gem>,
}

/// What a freshly minted gem starts with.
struct GemSeed {
    stock_id: StockId,
    attributes: GemAttributes,
    valuation: Valuation,
    quantity: u32,
    origin: GemOrigin,
}

/// Terminal state of a consignment that became an invoice.
#[derive(Debug, Clone, Copy)]
enum Invoiced {
    Purchased,
    Converted,
}

pub struct InventoryLedger<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    config: LedgerConfig,
}

impl<S, B> InventoryLedger<S, B> {
    pub fn new(store: S, bus: B, config: LedgerConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    pub fn bus(&self) -> &B {
        self.dispatcher.bus()
    }
}

impl<S, B> InventoryLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    // ----- gems -----

    /// Enter a new gem with `quantity` units in stock and claim its stock ID.
    pub fn register_gem(&self, request: NewGem, operator: OperatorId) -> Result<Gem, LedgerError> {
        let occurred_at = Utc::now();
        let stock_id = self.stock_id_or_generate(request.stock_id)?;

        let mut uow = UnitOfWork::new(self.store());
        let gem = self.stage_new_gem(
            &mut uow,
            GemSeed {
                stock_id,
                attributes: request.attributes,
                valuation: Valuation {
                    carat: request.carat,
                    cost: request.cost,
                    price: request.price,
                },
                quantity: request.quantity,
                origin: GemOrigin::Manual,
            },
            operator,
            occurred_at,
        )?;
        uow.commit(self.bus())?;

        tracing::info!(
            gem_id = %gem.id_typed(),
            stock_id = ?gem.stock_id(),
            operator = %operator,
            quantity = gem.in_stock(),
            carat = %gem.carat(),
            "gem registered"
        );
        Ok(gem)
    }

    pub fn gem(&self, gem_id: GemId) -> Result<Gem, LedgerError> {
        let (gem, _) = load_aggregate(self.store(), gem_id.0, GEM_AGGREGATE_TYPE, |id| {
            Gem::empty(GemId::new(id))
        })?;
        if !gem.is_created() {
            return Err(LedgerError::NotFound(format!("gem {gem_id}")));
        }
        Ok(gem)
    }

    /// Every gem, retired ones included, in registration order.
    pub fn gems(&self) -> Result<Vec<Gem>, LedgerError> {
        load_all(self.store(), GEM_AGGREGATE_TYPE, |id| Gem::empty(GemId::new(id)))
    }

    /// Administrative status correction. Counters are untouched; the next ledger
    /// operation on the gem re-derives the status.
    pub fn override_status(
        &self,
        gem_id: GemId,
        status: GemStatus,
        reason: impl Into<String>,
        operator: OperatorId,
    ) -> Result<Gem, LedgerError> {
        let reason = reason.into();
        let out = self.dispatcher.dispatch(
            gem_id.0,
            GEM_AGGREGATE_TYPE,
            GemCommand::OverrideStatus(OverrideStatus {
                gem_id,
                status,
                reason: reason.clone(),
                operator,
                occurred_at: Utc::now(),
            }),
            |id| Gem::empty(GemId::new(id)),
        )?;

        tracing::info!(
            gem_id = %gem_id,
            status = %status,
            reason = %reason,
            operator = %operator,
            "gem status overridden"
        );
        Ok(out.aggregate)
    }

    // ----- consignments -----

    /// Reserve every line's quantity and carat and record the consignment, atomically.
    pub fn create_consignment(
        &self,
        request: NewConsignment,
        operator: OperatorId,
    ) -> Result<Consignment, LedgerError> {
        let occurred_at = Utc::now();
        let consignment_id = ConsignmentId::new(AggregateId::new());

        let mut uow = UnitOfWork::new(self.store());
        let mut consignment = load_consignment(&uow, consignment_id)?;
        consignment.execute(&ConsignmentCommand::CreateConsignment(CreateConsignment {
            consignment_id,
            customer_id: request.customer_id,
            items: request.items.clone(),
            return_date: request.return_date,
            operator,
            occurred_at,
        }))?;

        let mut gems = BTreeMap::new();
        for item in &request.items {
            tracked_gem(&uow, &mut gems, item.gem_id)?.execute(
                &GemCommand::ReserveForConsignment(ReserveForConsignment {
                    gem_id: item.gem_id,
                    consignment_id: consignment_id.0,
                    quantity: item.quantity,
                    carat: item.carat,
                    operator,
                    occurred_at,
                }),
            )?;
        }

        stage_gems(&mut uow, gems)?;
        let consignment = uow.stage(consignment)?;
        uow.commit(self.bus())?;

        tracing::info!(
            consignment_id = %consignment_id,
            customer_id = %request.customer_id,
            lines = request.items.len(),
            total = %consignment.total_value(),
            operator = %operator,
            "consignment created"
        );
        Ok(consignment)
    }

    /// Customer sent everything back: release every line to stock.
    pub fn return_consignment(
        &self,
        consignment_id: ConsignmentId,
        operator: OperatorId,
    ) -> Result<Consignment, LedgerError> {
        self.release_consignment(consignment_id, ReleaseOutcome::Returned, operator)
    }

    /// Delete a consignment in any status; a pending one releases its lines first.
    pub fn delete_consignment(
        &self,
        consignment_id: ConsignmentId,
        operator: OperatorId,
    ) -> Result<Consignment, LedgerError> {
        self.release_consignment(consignment_id, ReleaseOutcome::Deleted, operator)
    }

    /// Customer buys the consigned stones; the consignment ends `Purchased`.
    pub fn purchase_consignment(
        &self,
        consignment_id: ConsignmentId,
        due_date: DateTime<Utc>,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        self.invoice_consignment(consignment_id, due_date, Invoiced::Purchased, operator)
    }

    /// Replace the consignment with an invoice; the consignment ends `Inactive`.
    pub fn convert_consignment_to_invoice(
        &self,
        consignment_id: ConsignmentId,
        due_date: DateTime<Utc>,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        self.invoice_consignment(consignment_id, due_date, Invoiced::Converted, operator)
    }

    pub fn consignment(&self, consignment_id: ConsignmentId) -> Result<Consignment, LedgerError> {
        let (consignment, _) = load_aggregate(
            self.store(),
            consignment_id.0,
            CONSIGNMENT_AGGREGATE_TYPE,
            |id| Consignment::empty(ConsignmentId::new(id)),
        )?;
        if !consignment.is_created() {
            return Err(LedgerError::NotFound(format!("consignment {consignment_id}")));
        }
        Ok(consignment)
    }

    pub fn consignments(&self) -> Result<Vec<Consignment>, LedgerError> {
        load_all(self.store(), CONSIGNMENT_AGGREGATE_TYPE, |id| {
            Consignment::empty(ConsignmentId::new(id))
        })
    }

    // ----- invoices -----

    /// Sell straight out of stock. Every line moves `in_stock` to `sold`.
    pub fn create_invoice(&self, request: NewInvoice, operator: OperatorId) -> Result<Invoice, LedgerError> {
        let occurred_at = Utc::now();
        let invoice_id = InvoiceId::new(AggregateId::new());

        let mut uow = UnitOfWork::new(self.store());
        let mut invoice = load_invoice(&uow, invoice_id)?;
        invoice.execute(&InvoiceCommand::CreateInvoice(CreateInvoice {
            invoice_id,
            customer_id: request.customer_id,
            source: InvoiceSource::Direct,
            items: request.items.clone(),
            due_date: request.due_date,
            operator,
            occurred_at,
        }))?;

        let mut gems = BTreeMap::new();
        for item in &request.items {
            tracked_gem(&uow, &mut gems, item.gem_id)?.execute(&GemCommand::RecordSale(
                RecordSale {
                    gem_id: item.gem_id,
                    invoice_id: invoice_id.0,
                    quantity: item.quantity,
                    carat: item.carat,
                    from_consignment: false,
                    operator,
                    occurred_at,
                },
            ))?;
        }

        stage_gems(&mut uow, gems)?;
        let invoice = uow.stage(invoice)?;
        uow.commit(self.bus())?;

        tracing::info!(
            invoice_id = %invoice_id,
            customer_id = %request.customer_id,
            lines = request.items.len(),
            total = %invoice.total_amount(),
            operator = %operator,
            "invoice created"
        );
        Ok(invoice)
    }

    pub fn mark_invoice_sent(&self, invoice_id: InvoiceId, operator: OperatorId) -> Result<Invoice, LedgerError> {
        let invoice = self.dispatch_invoice(
            invoice_id,
            InvoiceCommand::MarkSent(MarkSent {
                invoice_id,
                operator,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(invoice_id = %invoice_id, operator = %operator, "invoice sent");
        Ok(invoice)
    }

    pub fn mark_invoice_overdue(
        &self,
        invoice_id: InvoiceId,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        let invoice = self.dispatch_invoice(
            invoice_id,
            InvoiceCommand::MarkOverdue(MarkOverdue {
                invoice_id,
                operator,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(invoice_id = %invoice_id, operator = %operator, "invoice overdue");
        Ok(invoice)
    }

    pub fn record_invoice_payment(
        &self,
        invoice_id: InvoiceId,
        amount: Decimal,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        let invoice = self.dispatch_invoice(
            invoice_id,
            InvoiceCommand::RecordPayment(RecordPayment {
                invoice_id,
                amount,
                operator,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(
            invoice_id = %invoice_id,
            amount = %amount,
            outstanding = %invoice.outstanding_amount(),
            operator = %operator,
            "invoice payment recorded"
        );
        Ok(invoice)
    }

    /// Cancel an invoice. Sold stock stays sold.
    pub fn cancel_invoice(
        &self,
        invoice_id: InvoiceId,
        reason: Option<String>,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        let invoice = self.dispatch_invoice(
            invoice_id,
            InvoiceCommand::CancelInvoice(CancelInvoice {
                invoice_id,
                reason: reason.clone(),
                operator,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(
            invoice_id = %invoice_id,
            reason = reason.as_deref().unwrap_or(""),
            operator = %operator,
            "invoice cancelled"
        );
        Ok(invoice)
    }

    pub fn invoice(&self, invoice_id: InvoiceId) -> Result<Invoice, LedgerError> {
        let (invoice, _) =
            load_aggregate(self.store(), invoice_id.0, INVOICE_AGGREGATE_TYPE, |id| {
                Invoice::empty(InvoiceId::new(id))
            })?;
        if !invoice.is_created() {
            return Err(LedgerError::NotFound(format!("invoice {invoice_id}")));
        }
        Ok(invoice)
    }

    pub fn invoices(&self) -> Result<Vec<Invoice>, LedgerError> {
        load_all(self.store(), INVOICE_AGGREGATE_TYPE, |id| Invoice::empty(InvoiceId::new(id)))
    }

    // ----- merge / split -----

    /// Retire two or more gems and mint one gem carrying their summed carat, cost and price.
    pub fn merge_gems(
        &self,
        request: MergeRequest,
        operator: OperatorId,
    ) -> Result<MergeSplitOutcome, LedgerError> {
        let occurred_at = Utc::now();
        let operation_id = AggregateId::new();
        let mut uow = UnitOfWork::new(self.store());

        let mut sources = Vec::with_capacity(request.sources.len());
        for gem_id in &request.sources {
            sources.push(load_gem(&uow, *gem_id)?);
        }
        let states: Vec<&Gem> = sources.iter().map(Tracked::state).collect();
        let before = merged_valuation(&states)?;
        let source_refs = states
            .iter()
            .map(|g| gem_ref(g))
            .collect::<Result<Vec<_>, _>>()?;
        let attributes = match request.attributes {
            Some(a) => a,
            None => states
                .first()
                .map(|g| g.attributes().clone())
                .unwrap_or_default(),
        };

        let stock_id = self.stock_id_or_generate(request.stock_id)?;
        let merged = self.stage_new_gem(
            &mut uow,
            GemSeed {
                stock_id,
                attributes,
                valuation: before,
                quantity: 1,
                origin: GemOrigin::Merge { operation_id },
            },
            operator,
            occurred_at,
        )?;

        let retired = retire_all(&mut uow, sources, operation_id, MergeSplitKind::Merge, operator, occurred_at)?;

        let record = MergeSplitRecorded {
            operation_id,
            kind: MergeSplitKind::Merge,
            sources: source_refs,
            outputs: vec![gem_ref(&merged)?],
            before,
            after: Valuation::of(&merged),
            operator,
            notes: request.notes,
            occurred_at,
        };
        uow.stage_new_stream(
            operation_id,
            MERGE_SPLIT_AGGREGATE_TYPE,
            &[MergeSplitEvent::MergeSplitRecorded(record.clone())],
        )?;
        uow.commit(self.bus())?;

        tracing::info!(
            operation_id = %operation_id,
            sources = retired.len(),
            merged_gem_id = %merged.id_typed(),
            carat = %before.carat,
            cost = %before.cost,
            price = %before.price,
            operator = %operator,
            "gems merged"
        );
        Ok(MergeSplitOutcome {
            record,
            retired,
            created: vec![merged],
        })
    }

    /// Retire one gem and mint one gem per portion. Portions must add back up to the
    /// source within the configured tolerance; otherwise nothing is written.
    pub fn split_gem(
        &self,
        request: SplitRequest,
        operator: OperatorId,
    ) -> Result<MergeSplitOutcome, LedgerError> {
        let occurred_at = Utc::now();
        let operation_id = AggregateId::new();
        let mut uow = UnitOfWork::new(self.store());

        let source = load_gem(&uow, request.source)?;
        let after = validate_split(source.state(), &request.portions, self.config.split_tolerance)?;
        let before = Valuation::of(source.state());
        let source_ref = gem_ref(source.state())?;
        let source_attributes = source.state().attributes().clone();

        let mut stock_ids = Vec::with_capacity(request.portions.len());
        let mut seen = HashSet::new();
        for portion in &request.portions {
            let stock_id = self.stock_id_or_generate(portion.stock_id.clone())?;
            if !seen.insert(stock_id.clone()) {
                return Err(LedgerError::Validation(format!(
                    "stock id {stock_id} is used by more than one portion"
                )));
            }
            stock_ids.push(stock_id);
        }

        let mut created = Vec::with_capacity(request.portions.len());
        for (portion, stock_id) in request.portions.iter().zip(stock_ids) {
            created.push(self.stage_new_gem(
                &mut uow,
                GemSeed {
                    stock_id,
                    attributes: portion
                        .attributes
                        .clone()
                        .unwrap_or_else(|| source_attributes.clone()),
                    valuation: portion.valuation(),
                    quantity: 1,
                    origin: GemOrigin::Split { operation_id },
                },
                operator,
                occurred_at,
            )?);
        }

        let retired = retire_all(
            &mut uow,
            vec![source],
            operation_id,
            MergeSplitKind::Split,
            operator,
            occurred_at,
        )?;

        let record = MergeSplitRecorded {
            operation_id,
            kind: MergeSplitKind::Split,
            sources: vec![source_ref],
            outputs: created.iter().map(gem_ref).collect::<Result<Vec<_>, _>>()?,
            before,
            after,
            operator,
            notes: request.notes,
            occurred_at,
        };
        uow.stage_new_stream(
            operation_id,
            MERGE_SPLIT_AGGREGATE_TYPE,
            &[MergeSplitEvent::MergeSplitRecorded(record.clone())],
        )?;
        uow.commit(self.bus())?;

        tracing::info!(
            operation_id = %operation_id,
            source_gem_id = %request.source,
            portions = created.len(),
            carat = %before.carat,
            operator = %operator,
            "gem split"
        );
        Ok(MergeSplitOutcome {
            record,
            retired,
            created,
        })
    }

    /// Audit log of every merge and split, oldest first.
    pub fn merge_split_history(&self) -> Result<Vec<MergeSplitRecorded>, LedgerError> {
        self.store()
            .load_by_aggregate_type(MERGE_SPLIT_AGGREGATE_TYPE)?
            .iter()
            .map(|stored| {
                decode::<MergeSplitEvent>(stored).map(|e| match e {
                    MergeSplitEvent::MergeSplitRecorded(r) => r,
                })
            })
            .collect()
    }

    // ----- maintenance -----

    /// Compare recorded, counter-derived and reference-derived status for every gem.
    /// Read-only; discrepancies are logged and returned.
    pub fn reconcile_statuses(&self) -> Result<ReconciliationReport, LedgerError> {
        let gems = self.gems()?;
        let consignments = self.consignments()?;
        let invoices = self.invoices()?;

        let report = reconcile(&gems, &consignments, &invoices);
        for d in &report.discrepancies {
            tracing::warn!(
                gem_id = %d.gem_id,
                stock_id = ?d.stock_id,
                recorded = %d.recorded,
                from_counters = %d.from_counters,
                from_references = %d.from_references,
                "gem status discrepancy"
            );
        }
        tracing::info!(
            scanned = report.scanned,
            discrepancies = report.discrepancies.len(),
            "status reconciliation finished"
        );
        Ok(report)
    }

    // ----- helpers -----

    fn dispatch_invoice(&self, invoice_id: InvoiceId, command: InvoiceCommand) -> Result<Invoice, LedgerError> {
        let out = self.dispatcher.dispatch(invoice_id.0, INVOICE_AGGREGATE_TYPE, command, |id| {
            Invoice::empty(InvoiceId::new(id))
        })?;
        Ok(out.aggregate)
    }

    fn stock_id_or_generate(&self, stock_id: Option<StockId>) -> Result<StockId, LedgerError> {
        match stock_id {
            Some(id) => Ok(id),
            None => Ok(StockId::generate(&self.config.stock_id_prefix)?),
        }
    }

    /// Stage a stock-ID claim and the registration of a new gem.
    fn stage_new_gem(
        &self,
        uow: &mut UnitOfWork<'_, S>,
        seed: GemSeed,
        operator: OperatorId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Gem, LedgerError> {
        let gem_id = GemId::new(AggregateId::new());

        let claim_key = seed.stock_id.claim_key();
        if !self.store().load_stream(claim_key)?.is_empty() {
            return Err(LedgerError::Conflict(format!(
                "stock id {} is already in use",
                seed.stock_id
            )));
        }

        let mut gem = load_gem(uow, gem_id)?;
        gem.execute(&GemCommand::RegisterGem(RegisterGem {
            gem_id,
            stock_id: seed.stock_id.clone(),
            attributes: seed.attributes,
            carat: seed.valuation.carat,
            cost: seed.valuation.cost,
            price: seed.valuation.price,
            quantity: seed.quantity,
            origin: seed.origin,
            operator,
            occurred_at,
        }))?;

        // Exact(0) on the claim stream rejects a concurrent claim of the same code.
        uow.stage_new_stream(
            claim_key,
            STOCK_ID_AGGREGATE_TYPE,
            &[StockIdEvent::StockIdClaimed(StockIdClaimed {
                stock_id: seed.stock_id,
                gem_id,
                operator,
                occurred_at,
            })],
        )?;
        uow.stage(gem)
    }

    fn release_consignment(
        &self,
        consignment_id: ConsignmentId,
        outcome: ReleaseOutcome,
        operator: OperatorId,
    ) -> Result<Consignment, LedgerError> {
        let occurred_at = Utc::now();
        let mut uow = UnitOfWork::new(self.store());

        let mut consignment = load_consignment(&uow, consignment_id)?;
        let was_pending = consignment.state().is_pending();
        let command = match outcome {
            ReleaseOutcome::Returned => ConsignmentCommand::MarkReturned(MarkReturned {
                consignment_id,
                operator,
                occurred_at,
            }),
            ReleaseOutcome::Deleted => ConsignmentCommand::DeleteConsignment(DeleteConsignment {
                consignment_id,
                operator,
                occurred_at,
            }),
        };
        consignment.execute(&command)?;

        let mut gems = BTreeMap::new();
        if was_pending {
            let items = consignment.state().items().to_vec();
            for item in &items {
                tracked_gem(&uow, &mut gems, item.gem_id)?.execute(
                    &GemCommand::ReleaseConsignment(ReleaseConsignment {
                        gem_id: item.gem_id,
                        consignment_id: consignment_id.0,
                        quantity: item.quantity,
                        carat: item.carat,
                        outcome,
                        operator,
                        occurred_at,
                    }),
                )?;
            }
        }
        let released_lines = gems.len();

        stage_gems(&mut uow, gems)?;
        let consignment = uow.stage(consignment)?;
        uow.commit(self.bus())?;

        tracing::info!(
            consignment_id = %consignment_id,
            outcome = ?outcome,
            released_gems = released_lines,
            operator = %operator,
            "consignment released"
        );
        Ok(consignment)
    }

    fn invoice_consignment(
        &self,
        consignment_id: ConsignmentId,
        due_date: DateTime<Utc>,
        how: Invoiced,
        operator: OperatorId,
    ) -> Result<Invoice, LedgerError> {
        let occurred_at = Utc::now();
        let invoice_id = InvoiceId::new(AggregateId::new());
        let mut uow = UnitOfWork::new(self.store());

        let mut consignment = load_consignment(&uow, consignment_id)?;
        let command = match how {
            Invoiced::Purchased => ConsignmentCommand::MarkPurchased(MarkPurchased {
                consignment_id,
                invoice_id: invoice_id.0,
                operator,
                occurred_at,
            }),
            Invoiced::Converted => {
                ConsignmentCommand::DeactivateConsignment(DeactivateConsignment {
                    consignment_id,
                    invoice_id: invoice_id.0,
                    operator,
                    occurred_at,
                })
            }
        };
        consignment.execute(&command)?;

        let customer_id = consignment
            .state()
            .customer_id()
            .ok_or_else(|| LedgerError::NotFound(format!("consignment {consignment_id}")))?;
        let items: Vec<InvoiceItem> = consignment
            .state()
            .items()
            .iter()
            .map(|i| InvoiceItem::new(i.gem_id, i.quantity, i.carat, i.price_per_carat))
            .collect();

        let mut invoice = load_invoice(&uow, invoice_id)?;
        invoice.execute(&InvoiceCommand::CreateInvoice(CreateInvoice {
            invoice_id,
            customer_id,
            source: InvoiceSource::Consignment(consignment_id),
            items: items.clone(),
            due_date,
            operator,
            occurred_at,
        }))?;

        let mut gems = BTreeMap::new();
        for item in &items {
            tracked_gem(&uow, &mut gems, item.gem_id)?.execute(&GemCommand::RecordSale(
                RecordSale {
                    gem_id: item.gem_id,
                    invoice_id: invoice_id.0,
                    quantity: item.quantity,
                    carat: item.carat,
                    from_consignment: true,
                    operator,
                    occurred_at,
                },
            ))?;
        }

        stage_gems(&mut uow, gems)?;
        uow.stage(consignment)?;
        let invoice = uow.stage(invoice)?;
        uow.commit(self.bus())?;

        tracing::info!(
            consignment_id = %consignment_id,
            invoice_id = %invoice_id,
            outcome = ?how,
            total = %invoice.total_amount(),
            operator = %operator,
            "consignment invoiced"
        );
        Ok(invoice)
    }
}

fn load_gem<S: EventStore + ?Sized>(uow: &UnitOfWork<'_, S>, gem_id: GemId) -> Result<Tracked<Gem>, LedgerError> {
    uow.load(gem_id.0, GEM_AGGREGATE_TYPE, |id| Gem::empty(GemId::new(id)))
}

fn load_consignment<S: EventStore + ?Sized>(
    uow: &UnitOfWork<'_, S>,
    consignment_id: ConsignmentId,
) -> Result<Tracked<Consignment>, LedgerError> {
    uow.load(consignment_id.0, CONSIGNMENT_AGGREGATE_TYPE, |id| {
        Consignment::empty(ConsignmentId::new(id))
    })
}

fn load_invoice<S: EventStore + ?Sized>(
    uow: &UnitOfWork<'_, S>,
    invoice_id: InvoiceId,
) -> Result<Tracked<Invoice>, LedgerError> {
    uow.load(invoice_id.0, INVOICE_AGGREGATE_TYPE, |id| Invoice::empty(InvoiceId::new(id)))
}

/// Load a gem once per unit so lines on the same gem fold onto one state.
fn tracked_gem<'m, S: EventStore + ?Sized>(
    uow: &UnitOfWork<'_, S>,
    gems: &'m mut BTreeMap<GemId, Tracked<Gem>>,
    gem_id: GemId,
) -> Result<&'m mut Tracked<Gem>, LedgerError> {
    if !gems.contains_key(&gem_id) {
        let tracked = load_gem(uow, gem_id)?;
        gems.insert(gem_id, tracked);
    }
    gems.get_mut(&gem_id)
        .ok_or_else(|| LedgerError::NotFound(format!("gem {gem_id}")))
}

fn stage_gems<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    gems: BTreeMap<GemId, Tracked<Gem>>,
) -> Result<Vec<Gem>, LedgerError> {
    gems.into_values().map(|g| uow.stage(g)).collect()
}

fn retire_all<S: EventStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    sources: Vec<Tracked<Gem>>,
    operation_id: AggregateId,
    kind: MergeSplitKind,
    operator: OperatorId,
    occurred_at: DateTime<Utc>,
) -> Result<Vec<Gem>, LedgerError> {
    let mut retired = Vec::with_capacity(sources.len());
    for mut source in sources {
        let gem_id = source.state().id_typed();
        source.execute(&GemCommand::RetireForMergeOrSplit(RetireForMergeOrSplit {
            gem_id,
            operation_id,
            kind,
            operator,
            occurred_at,
        }))?;
        retired.push(uow.stage(source)?);
    }
    Ok(retired)
}

fn gem_ref(gem: &Gem) -> Result<GemRef, LedgerError> {
    let stock_id = gem
        .stock_id()
        .cloned()
        .ok_or_else(|| LedgerError::NotFound(format!("gem {}", gem.id_typed())))?;
    Ok(GemRef {
        gem_id: gem.id_typed(),
        stock_id,
    })
}
