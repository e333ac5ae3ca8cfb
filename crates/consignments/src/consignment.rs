use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use gemledger_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError, OperatorId};
use gemledger_events::Event;
use gemledger_inventory::{ensure_magnitude, GemId};

/// Aggregate type under which consignment streams are stored.
pub const CONSIGNMENT_AGGREGATE_TYPE: &str = "consignments.consignment";

/// Consignment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsignmentId(pub AggregateId);

impl ConsignmentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ConsignmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Consignment lifecycle. Only `Pending` accepts transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsignmentStatus {
    Pending,
    Returned,
    Purchased,
    /// Converted into an invoice; no further ledger effect.
    Inactive,
}

/// Carat × price per carat, rounded half-up to cents.
///
/// Saturates instead of overflowing; line validation rejects inputs above
/// `MAX_MAGNITUDE`, so a saturated total never reaches the ledger.
pub fn line_total(carat: Decimal, price_per_carat: Decimal) -> Decimal {
    carat
        .saturating_mul(price_per_carat)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One consigned stone (or part of one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentItem {
    pub gem_id: GemId,
    pub quantity: u32,
    /// Carat consigned; may be a fraction of the gem's total carat.
    pub carat: Decimal,
    pub price_per_carat: Decimal,
    pub total_price: Decimal,
}

impl ConsignmentItem {
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

/// Aggregate root: Consignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consignment {
    id: ConsignmentId,
    customer_id: Option<CustomerId>,
    items: Vec<ConsignmentItem>,
    return_date: Option<DateTime<Utc>>,
    status: ConsignmentStatus,
    invoice_id: Option<AggregateId>,
    deleted: bool,
    version: u64,
    created: bool,
}

impl Consignment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ConsignmentId) -> Self {
        Self {
            id,
            customer_id: None,
            items: Vec::new(),
            return_date: None,
            status: ConsignmentStatus::Pending,
            invoice_id: None,
            deleted: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ConsignmentId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn items(&self) -> &[ConsignmentItem] {
        &self.items
    }

    pub fn return_date(&self) -> Option<DateTime<Utc>> {
        self.return_date
    }

    pub fn status(&self) -> ConsignmentStatus {
        self.status
    }

    /// Invoice that purchased or replaced this consignment.
    pub fn invoice_id(&self) -> Option<AggregateId> {
        self.invoice_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Still holding its gems in the `reserved` bucket.
    pub fn is_pending(&self) -> bool {
        self.created && !self.deleted && self.status == ConsignmentStatus::Pending
    }

    pub fn total_value(&self) -> Decimal {
        self.items
            .iter()
            .fold(Decimal::ZERO, |acc, i| acc.saturating_add(i.total_price))
    }
}

impl AggregateRoot for Consignment {
    type Id = ConsignmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateConsignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConsignment {
    pub consignment_id: ConsignmentId,
    pub customer_id: CustomerId,
    pub items: Vec<ConsignmentItem>,
    pub return_date: DateTime<Utc>,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReturned {
    pub consignment_id: ConsignmentId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPurchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPurchased {
    pub consignment_id: ConsignmentId,
    pub invoice_id: AggregateId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateConsignment (converted into an invoice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateConsignment {
    pub consignment_id: ConsignmentId,
    pub invoice_id: AggregateId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteConsignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteConsignment {
    pub consignment_id: ConsignmentId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsignmentCommand {
    CreateConsignment(CreateConsignment),
    MarkReturned(MarkReturned),
    MarkPurchased(MarkPurchased),
    DeactivateConsignment(DeactivateConsignment),
    DeleteConsignment(DeleteConsignment),
}

/// Event: ConsignmentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentCreated {
    pub consignment_id: ConsignmentId,
    pub customer_id: CustomerId,
    pub items: Vec<ConsignmentItem>,
    pub return_date: DateTime<Utc>,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsignmentReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentReturned {
    pub consignment_id: ConsignmentId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsignmentPurchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentPurchased {
    pub consignment_id: ConsignmentId,
    pub invoice_id: AggregateId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsignmentDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentDeactivated {
    pub consignment_id: ConsignmentId,
    pub invoice_id: AggregateId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsignmentDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentDeleted {
    pub consignment_id: ConsignmentId,
    /// Whether the reservation was still live (and therefore released) at deletion.
    pub was_pending: bool,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsignmentEvent {
    ConsignmentCreated(ConsignmentCreated),
    ConsignmentReturned(ConsignmentReturned),
    ConsignmentPurchased(ConsignmentPurchased),
    ConsignmentDeactivated(ConsignmentDeactivated),
    ConsignmentDeleted(ConsignmentDeleted),
}

impl Event for ConsignmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConsignmentEvent::ConsignmentCreated(_) => "consignments.consignment.created",
            ConsignmentEvent::ConsignmentReturned(_) => "consignments.consignment.returned",
            ConsignmentEvent::ConsignmentPurchased(_) => "consignments.consignment.purchased",
            ConsignmentEvent::ConsignmentDeactivated(_) => "consignments.consignment.deactivated",
            ConsignmentEvent::ConsignmentDeleted(_) => "consignments.consignment.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ConsignmentEvent::ConsignmentCreated(e) => e.occurred_at,
            ConsignmentEvent::ConsignmentReturned(e) => e.occurred_at,
            ConsignmentEvent::ConsignmentPurchased(e) => e.occurred_at,
            ConsignmentEvent::ConsignmentDeactivated(e) => e.occurred_at,
            ConsignmentEvent::ConsignmentDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Consignment {
    type Command = ConsignmentCommand;
    type Event = ConsignmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ConsignmentEvent::ConsignmentCreated(e) => {
                self.id = e.consignment_id;
                self.customer_id = Some(e.customer_id);
                self.items = e.items.clone();
                self.return_date = Some(e.return_date);
                self.status = ConsignmentStatus::Pending;
                self.created = true;
            }
            ConsignmentEvent::ConsignmentReturned(_) => {
                self.status = ConsignmentStatus::Returned;
            }
            ConsignmentEvent::ConsignmentPurchased(e) => {
                self.status = ConsignmentStatus::Purchased;
                self.invoice_id = Some(e.invoice_id);
            }
            ConsignmentEvent::ConsignmentDeactivated(e) => {
                self.status = ConsignmentStatus::Inactive;
                self.invoice_id = Some(e.invoice_id);
            }
            ConsignmentEvent::ConsignmentDeleted(_) => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ConsignmentCommand::CreateConsignment(cmd) => self.handle_create(cmd),
            ConsignmentCommand::MarkReturned(cmd) => {
                self.ensure_pending(cmd.consignment_id, "return")?;
                Ok(vec![ConsignmentEvent::ConsignmentReturned(ConsignmentReturned {
                    consignment_id: cmd.consignment_id,
                    operator: cmd.operator,
                    occurred_at: cmd.occurred_at,
                })])
            }
            ConsignmentCommand::MarkPurchased(cmd) => {
                self.ensure_pending(cmd.consignment_id, "purchase")?;
                Ok(vec![ConsignmentEvent::ConsignmentPurchased(ConsignmentPurchased {
                    consignment_id: cmd.consignment_id,
                    invoice_id: cmd.invoice_id,
                    operator: cmd.operator,
                    occurred_at: cmd.occurred_at,
                })])
            }
            ConsignmentCommand::DeactivateConsignment(cmd) => {
                self.ensure_pending(cmd.consignment_id, "convert")?;
                Ok(vec![ConsignmentEvent::ConsignmentDeactivated(ConsignmentDeactivated {
                    consignment_id: cmd.consignment_id,
                    invoice_id: cmd.invoice_id,
                    operator: cmd.operator,
                    occurred_at: cmd.occurred_at,
                })])
            }
            ConsignmentCommand::DeleteConsignment(cmd) => {
                self.ensure_exists(cmd.consignment_id)?;
                Ok(vec![ConsignmentEvent::ConsignmentDeleted(ConsignmentDeleted {
                    consignment_id: cmd.consignment_id,
                    was_pending: self.status == ConsignmentStatus::Pending,
                    operator: cmd.operator,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl Consignment {
    fn ensure_exists(&self, consignment_id: ConsignmentId) -> Result<(), DomainError> {
        if !self.created || self.deleted {
            return Err(DomainError::not_found(format!("consignment {consignment_id}")));
        }
        if self.id != consignment_id {
            return Err(DomainError::invariant("consignment_id mismatch"));
        }
        Ok(())
    }

    fn ensure_pending(&self, consignment_id: ConsignmentId, action: &str) -> Result<(), DomainError> {
        self.ensure_exists(consignment_id)?;
        if self.status != ConsignmentStatus::Pending {
            return Err(DomainError::conflict(format!(
                "cannot {action} consignment in status {:?}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateConsignment) -> Result<Vec<ConsignmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("consignment already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation(
                "cannot create consignment without items",
            ));
        }
        if cmd.return_date < cmd.occurred_at {
            return Err(DomainError::validation(
                "return date cannot be before the consignment date",
            ));
        }
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
        }

        Ok(vec![ConsignmentEvent::ConsignmentCreated(ConsignmentCreated {
            consignment_id: cmd.consignment_id,
            customer_id: cmd.customer_id,
            items: cmd.items.clone(),
            return_date: cmd.return_date,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn test_consignment_id() -> ConsignmentId {
        ConsignmentId::new(AggregateId::new())
    }

    fn test_gem_id() -> GemId {
        GemId::new(AggregateId::new())
    }

    fn created(consignment_id: ConsignmentId) -> Consignment {
        let mut consignment = Consignment::empty(consignment_id);
        let now = Utc::now();
        let cmd = CreateConsignment {
            consignment_id,
            customer_id: CustomerId::new(),
            items: vec![ConsignmentItem::new(test_gem_id(), 2, dec!(1.5), dec!(1000))],
            return_date: now + Duration::days(14),
            operator: OperatorId::new(),
            occurred_at: now,
        };
        let events = consignment
            .handle(&ConsignmentCommand::CreateConsignment(cmd))
            .unwrap();
        consignment.apply(&events[0]);
        consignment
    }

    #[test]
    fn item_total_is_carat_times_rate() {
        let item = ConsignmentItem::new(test_gem_id(), 1, dec!(1.234), dec!(1000.005));
        assert_eq!(item.total_price, dec!(1234.01));
    }

    #[test]
    fn create_starts_pending() {
        let c = created(test_consignment_id());
        assert_eq!(c.status(), ConsignmentStatus::Pending);
        assert!(c.is_pending());
        assert_eq!(c.total_value(), dec!(1500.00));
        assert_eq!(c.version(), 1);
    }

    #[test]
    fn create_rejects_tampered_total() {
        let consignment_id = test_consignment_id();
        let consignment = Consignment::empty(consignment_id);
        let mut item = ConsignmentItem::new(test_gem_id(), 1, dec!(2), dec!(100));
        item.total_price = dec!(1);
        let now = Utc::now();
        let cmd = CreateConsignment {
            consignment_id,
            customer_id: CustomerId::new(),
            items: vec![item],
            return_date: now,
            operator: OperatorId::new(),
            occurred_at: now,
        };
        let err = consignment
            .handle(&ConsignmentCommand::CreateConsignment(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("total price")));
    }

    #[test]
    fn out_of_range_lines_are_rejected() {
        let item = ConsignmentItem::new(test_gem_id(), 1, Decimal::MAX, dec!(2));
        assert_eq!(item.total_price, Decimal::MAX);

        let consignment_id = test_consignment_id();
        let now = Utc::now();
        let cmd = CreateConsignment {
            consignment_id,
            customer_id: CustomerId::new(),
            items: vec![item],
            return_date: now,
            operator: OperatorId::new(),
            occurred_at: now,
        };
        let err = Consignment::empty(consignment_id)
            .handle(&ConsignmentCommand::CreateConsignment(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("item 1: carat")));
    }

    #[test]
    fn returned_consignment_is_terminal() {
        let consignment_id = test_consignment_id();
        let mut c = created(consignment_id);
        let events = c
            .handle(&ConsignmentCommand::MarkReturned(MarkReturned {
                consignment_id,
                operator: OperatorId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        c.apply(&events[0]);
        assert_eq!(c.status(), ConsignmentStatus::Returned);

        let err = c
            .handle(&ConsignmentCommand::MarkPurchased(MarkPurchased {
                consignment_id,
                invoice_id: AggregateId::new(),
                operator: OperatorId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn deactivation_links_invoice() {
        let consignment_id = test_consignment_id();
        let mut c = created(consignment_id);
        let invoice_id = AggregateId::new();
        let events = c
            .handle(&ConsignmentCommand::DeactivateConsignment(DeactivateConsignment {
                consignment_id,
                invoice_id,
                operator: OperatorId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        c.apply(&events[0]);
        assert_eq!(c.status(), ConsignmentStatus::Inactive);
        assert_eq!(c.invoice_id(), Some(invoice_id));
        assert!(!c.is_pending());
    }

    #[test]
    fn delete_reports_whether_reservation_was_live() {
        let consignment_id = test_consignment_id();
        let mut c = created(consignment_id);
        let delete = ConsignmentCommand::DeleteConsignment(DeleteConsignment {
            consignment_id,
            operator: OperatorId::new(),
            occurred_at: Utc::now(),
        });
        let events = c.handle(&delete).unwrap();
        match &events[0] {
            ConsignmentEvent::ConsignmentDeleted(e) => assert!(e.was_pending),
            other => panic!("expected ConsignmentDeleted, got {other:?}"),
        }
        c.apply(&events[0]);
        assert!(c.is_deleted());

        let err = c.handle(&delete).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }
}
