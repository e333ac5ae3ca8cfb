use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use gemledger_consignments::{ConsignmentId, line_total};
use gemledger_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError, OperatorId};
use gemledger_events::Event;
use gemledger_inventory::{ensure_magnitude, GemId};

/// Aggregate type under which invoice streams are stored.
pub const INVOICE_AGGREGATE_TYPE: &str = "invoicing.invoice";

/// Invoice identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice status lifecycle. Independent of the inventory ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

/// Where the invoiced stones came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "consignment_id", rename_all = "snake_case")]
pub enum InvoiceSource {
    /// Sold straight out of stock.
    Direct,
    /// Sold out of a pending consignment (purchase or conversion).
    Consignment(ConsignmentId),
}

impl InvoiceSource {
    pub fn is_from_consignment(&self) -> bool {
        matches!(self, InvoiceSource::Consignment(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub gem_id: GemId,
    pub quantity: u32,
    pub carat: Decimal,
    pub price_per_carat: Decimal,
    pub total_price: Decimal,
}

impl InvoiceItem {
    pub fn new(gem_id: GemId, quantity: u32, carat: Decimal, price_per_carat: Decimal) -> Self {
        Self {
            gem_id,
            quantity,
            carat,
            price_per_carat,
            total_price: line_total(carat, price_per_carat),
        }
    }
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    customer_id: Option<CustomerId>,
    source: InvoiceSource,
    status: InvoiceStatus,
    items: Vec<InvoiceItem>,
    due_date: Option<DateTime<Utc>>,
    total_amount: Decimal,
    total_paid: Decimal,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            customer_id: None,
            source: InvoiceSource::Direct,
            status: InvoiceStatus::Draft,
            items: Vec::new(),
            due_date: None,
            total_amount: Decimal::ZERO,
            total_paid: Decimal::ZERO,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn source(&self) -> InvoiceSource {
        self.source
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    pub fn total_paid(&self) -> Decimal {
        self.total_paid
    }

    pub fn outstanding_amount(&self) -> Decimal {
        (self.total_amount - self.total_paid).max(Decimal::ZERO)
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    /// Invariant: cannot pay cancelled or settled invoices.
    pub fn can_accept_payment(&self) -> bool {
        !matches!(self.status, InvoiceStatus::Cancelled | InvoiceStatus::Paid)
            && self.outstanding_amount() > Decimal::ZERO
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub source: InvoiceSource,
    pub items: Vec<InvoiceItem>,
    pub due_date: DateTime<Utc>,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkSent {
    pub invoice_id: InvoiceId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOverdue {
    pub invoice_id: InvoiceId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateInvoice(CreateInvoice),
    MarkSent(MarkSent),
    MarkOverdue(MarkOverdue),
    RecordPayment(RecordPayment),
    CancelInvoice(CancelInvoice),
}

/// Event: InvoiceCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub source: InvoiceSource,
    pub items: Vec<InvoiceItem>,
    pub due_date: DateTime<Utc>,
    pub total_amount: Decimal,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSent {
    pub invoice_id: InvoiceId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceMarkedOverdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMarkedOverdue {
    pub invoice_id: InvoiceId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecorded {
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub new_total_paid: Decimal,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub invoice_id: InvoiceId,
    pub reason: Option<String>,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceCreated(InvoiceCreated),
    InvoiceSent(InvoiceSent),
    InvoiceMarkedOverdue(InvoiceMarkedOverdue),
    PaymentRecorded(PaymentRecorded),
    InvoiceCancelled(InvoiceCancelled),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceCreated(_) => "invoicing.invoice.created",
            InvoiceEvent::InvoiceSent(_) => "invoicing.invoice.sent",
            InvoiceEvent::InvoiceMarkedOverdue(_) => "invoicing.invoice.marked_overdue",
            InvoiceEvent::PaymentRecorded(_) => "invoicing.invoice.payment_recorded",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.occurred_at,
            InvoiceEvent::InvoiceSent(e) => e.occurred_at,
            InvoiceEvent::InvoiceMarkedOverdue(e) => e.occurred_at,
            InvoiceEvent::PaymentRecorded(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceCreated(e) => {
                self.id = e.invoice_id;
                self.customer_id = Some(e.customer_id);
                self.source = e.source;
                self.items = e.items.clone();
                self.due_date = Some(e.due_date);
                self.total_amount = e.total_amount;
                self.total_paid = Decimal::ZERO;
                self.status = InvoiceStatus::Draft;
                self.created = true;
            }
            InvoiceEvent::InvoiceSent(_) => {
                self.status = InvoiceStatus::Sent;
            }
            InvoiceEvent::InvoiceMarkedOverdue(_) => {
                self.status = InvoiceStatus::Overdue;
            }
            InvoiceEvent::PaymentRecorded(e) => {
                self.total_paid = e.new_total_paid;
                if self.total_paid >= self.total_amount {
                    self.status = InvoiceStatus::Paid;
                }
            }
            InvoiceEvent::InvoiceCancelled(_) => {
                self.status = InvoiceStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateInvoice(cmd) => self.handle_create(cmd),
            InvoiceCommand::MarkSent(cmd) => self.handle_mark_sent(cmd),
            InvoiceCommand::MarkOverdue(cmd) => self.handle_mark_overdue(cmd),
            InvoiceCommand::RecordPayment(cmd) => self.handle_record_payment(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Invoice {
    fn ensure_exists(&self, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("invoice {invoice_id}")));
        }
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }

        if cmd.items.is_empty() {
            return Err(DomainError::validation("cannot create invoice without items"));
        }

        let mut total = Decimal::ZERO;
        for (idx, item) in cmd.items.iter().enumerate() {
            let line = idx + 1;
            if item.quantity == 0 {
                return Err(DomainError::validation(format!(
                    "item {line}: quantity must be positive"
                )));
            }
            if item.carat <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "item {line}: carat must be positive"
                )));
            }
            if item.price_per_carat < Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "item {line}: price per carat cannot be negative"
                )));
            }
            ensure_magnitude(&format!("item {line}: carat"), item.carat)?;
            ensure_magnitude(&format!("item {line}: price per carat"), item.price_per_carat)?;
            if item.total_price != line_total(item.carat, item.price_per_carat) {
                return Err(DomainError::validation(format!(
                    "item {line}: total price does not match carat × price per carat"
                )));
            }
            total = total
                .checked_add(item.total_price)
                .ok_or_else(|| DomainError::validation("invoice total is out of range"))?;
        }

        Ok(vec![InvoiceEvent::InvoiceCreated(InvoiceCreated {
            invoice_id: cmd.invoice_id,
            customer_id: cmd.customer_id,
            source: cmd.source,
            items: cmd.items.clone(),
            due_date: cmd.due_date,
            total_amount: total,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_sent(&self, cmd: &MarkSent) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_exists(cmd.invoice_id)?;
        if self.status != InvoiceStatus::Draft {
            return Err(DomainError::conflict(format!(
                "only draft invoices can be sent (status {:?})",
                self.status
            )));
        }

        Ok(vec![InvoiceEvent::InvoiceSent(InvoiceSent {
            invoice_id: cmd.invoice_id,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_overdue(&self, cmd: &MarkOverdue) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_exists(cmd.invoice_id)?;
        match self.status {
            InvoiceStatus::Sent => {}
            InvoiceStatus::Overdue => return Ok(vec![]),
            other => {
                return Err(DomainError::conflict(format!(
                    "only sent invoices can become overdue (status {other:?})"
                )));
            }
        }

        Ok(vec![InvoiceEvent::InvoiceMarkedOverdue(InvoiceMarkedOverdue {
            invoice_id: cmd.invoice_id,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_payment(
        &self,
        cmd: &RecordPayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_exists(cmd.invoice_id)?;

        if !self.can_accept_payment() {
            return Err(DomainError::invariant(
                "cannot record payment on cancelled or fully paid invoice",
            ));
        }

        if cmd.amount <= Decimal::ZERO {
            return Err(DomainError::validation("payment amount must be positive"));
        }

        let new_total_paid = self
            .total_paid
            .checked_add(cmd.amount)
            .ok_or_else(|| DomainError::invariant("payment total overflow"))?;

        if new_total_paid > self.total_amount {
            return Err(DomainError::invariant("cannot overpay invoice"));
        }

        Ok(vec![InvoiceEvent::PaymentRecorded(PaymentRecorded {
            invoice_id: cmd.invoice_id,
            amount: cmd.amount,
            new_total_paid,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_exists(cmd.invoice_id)?;

        match self.status {
            InvoiceStatus::Cancelled => {
                return Err(DomainError::conflict("invoice is already cancelled"));
            }
            InvoiceStatus::Paid => {
                return Err(DomainError::conflict("paid invoices cannot be cancelled"));
            }
            _ => {}
        }

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }
}
