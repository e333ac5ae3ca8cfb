use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use gemledger_core::{Aggregate, AggregateId, AggregateRoot, DomainError, OperatorId};
use gemledger_events::Event;

use crate::merge_split::MergeSplitKind;
use crate::stock_id::StockId;

/// Aggregate type under which gem streams are stored.
pub const GEM_AGGREGATE_TYPE: &str = "inventory.gem";

/// Largest carat, cost, price or per-carat rate the ledger accepts (10^9).
///
/// Keeps every sum and line product the ledger forms far inside `Decimal`'s range.
pub const MAX_MAGNITUDE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Reject a value above [`MAX_MAGNITUDE`].
pub fn ensure_magnitude(what: &str, value: Decimal) -> Result<(), DomainError> {
    if value > MAX_MAGNITUDE {
        return Err(DomainError::validation(format!(
            "{what} {value} exceeds the maximum of {MAX_MAGNITUDE}"
        )));
    }
    Ok(())
}

/// Gem identifier (opaque, stable). Distinct from the human-readable `StockId`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GemId(pub AggregateId);

impl GemId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for GemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Availability status of a gem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GemStatus {
    #[serde(rename = "In Stock")]
    InStock,
    Reserved,
    Sold,
}

impl GemStatus {
    /// Status implied by the quantity counters alone.
    pub fn from_counters(in_stock: u32, reserved: u32) -> Self {
        if in_stock > 0 {
            GemStatus::InStock
        } else if reserved > 0 {
            GemStatus::Reserved
        } else {
            GemStatus::Sold
        }
    }

    /// Status of a gem given its counters and remaining carat.
    ///
    /// A stone with no uncommitted carat left cannot be partially in stock, so carat
    /// depletion forces `Sold` whatever the counters say.
    pub fn derive(counters: QuantityCounters, carat: Decimal) -> Self {
        if carat <= Decimal::ZERO {
            GemStatus::Sold
        } else {
            Self::from_counters(counters.in_stock, counters.reserved)
        }
    }
}

impl core::fmt::Display for GemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GemStatus::InStock => write!(f, "In Stock"),
            GemStatus::Reserved => write!(f, "Reserved"),
            GemStatus::Sold => write!(f, "Sold"),
        }
    }
}

/// Ledger-owned quantity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityCounters {
    pub in_stock: u32,
    pub reserved: u32,
    pub sold: u32,
}

impl QuantityCounters {
    /// `in_stock + reserved + sold`; conserved by every non-creating operation.
    pub fn total(&self) -> u64 {
        u64::from(self.in_stock) + u64::from(self.reserved) + u64::from(self.sold)
    }
}

/// Business descriptors of a stone. The ledger never changes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemAttributes {
    pub gem_type: String,
    pub cut: Option<String>,
    pub color: Option<String>,
    pub certificate_no: Option<String>,
    pub measurements: Option<String>,
    pub description: Option<String>,
}

/// How a gem came into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GemOrigin {
    Manual,
    Merge { operation_id: AggregateId },
    Split { operation_id: AggregateId },
}

/// Why reserved units go back to stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseOutcome {
    Returned,
    Deleted,
}

/// Aggregate root: Gem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gem {
    id: GemId,
    stock_id: Option<StockId>,
    attributes: GemAttributes,
    cost: Decimal,
    price: Decimal,
    counters: QuantityCounters,
    carat: Decimal,
    reserved_carat: Decimal,
    status: GemStatus,
    origin: GemOrigin,
    retired: bool,
    version: u64,
    created: bool,
}

impl Gem {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: GemId) -> Self {
        Self {
            id,
            stock_id: None,
            attributes: GemAttributes::default(),
            cost: Decimal::ZERO,
            price: Decimal::ZERO,
            counters: QuantityCounters::default(),
            carat: Decimal::ZERO,
            reserved_carat: Decimal::ZERO,
            status: GemStatus::InStock,
            origin: GemOrigin::Manual,
            retired: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> GemId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn stock_id(&self) -> Option<&StockId> {
        self.stock_id.as_ref()
    }

    pub fn attributes(&self) -> &GemAttributes {
        &self.attributes
    }

    pub fn cost(&self) -> Decimal {
        self.cost
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn counters(&self) -> QuantityCounters {
        self.counters
    }

    pub fn in_stock(&self) -> u32 {
        self.counters.in_stock
    }

    pub fn reserved(&self) -> u32 {
        self.counters.reserved
    }

    pub fn sold(&self) -> u32 {
        self.counters.sold
    }

    /// Remaining uncommitted carat.
    pub fn carat(&self) -> Decimal {
        self.carat
    }

    /// Carat currently out on pending consignments.
    pub fn reserved_carat(&self) -> Decimal {
        self.reserved_carat
    }

    /// Recorded status (may differ from `derived_status` after an administrative override).
    pub fn status(&self) -> GemStatus {
        self.status
    }

    /// Status computed from counters and carat.
    pub fn derived_status(&self) -> GemStatus {
        if self.retired {
            GemStatus::Sold
        } else {
            GemStatus::derive(self.counters, self.carat)
        }
    }

    pub fn origin(&self) -> GemOrigin {
        self.origin
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

impl AggregateRoot for Gem {
    type Id = GemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterGem (manual entry or merge/split output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterGem {
    pub gem_id: GemId,
    pub stock_id: StockId,
    pub attributes: GemAttributes,
    pub carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
    pub quantity: u32,
    pub origin: GemOrigin,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveForConsignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveForConsignment {
    pub gem_id: GemId,
    pub consignment_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseConsignment (consignment returned or deleted while pending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConsignment {
    pub gem_id: GemId,
    pub consignment_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub outcome: ReleaseOutcome,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordSale. The only path that increments `sold` for a live gem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSale {
    pub gem_id: GemId,
    pub invoice_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub from_consignment: bool,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RetireForMergeOrSplit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetireForMergeOrSplit {
    pub gem_id: GemId,
    pub operation_id: AggregateId,
    pub kind: MergeSplitKind,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: OverrideStatus (administrative).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideStatus {
    pub gem_id: GemId,
    pub status: GemStatus,
    pub reason: String,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GemCommand {
    RegisterGem(RegisterGem),
    ReserveForConsignment(ReserveForConsignment),
    ReleaseConsignment(ReleaseConsignment),
    RecordSale(RecordSale),
    RetireForMergeOrSplit(RetireForMergeOrSplit),
    OverrideStatus(OverrideStatus),
}

/// Event: GemRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemRegistered {
    pub gem_id: GemId,
    pub stock_id: StockId,
    pub attributes: GemAttributes,
    pub carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
    pub quantity: u32,
    pub origin: GemOrigin,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GemReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemReserved {
    pub gem_id: GemId,
    pub consignment_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ConsignmentReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentReleased {
    pub gem_id: GemId,
    pub consignment_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub outcome: ReleaseOutcome,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SaleRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecorded {
    pub gem_id: GemId,
    pub invoice_id: AggregateId,
    pub quantity: u32,
    pub carat: Decimal,
    pub from_consignment: bool,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GemRetired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemRetired {
    pub gem_id: GemId,
    pub operation_id: AggregateId,
    pub kind: MergeSplitKind,
    /// In-stock units consumed by the operation (moved to `sold`).
    pub consumed_quantity: u32,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusOverridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOverridden {
    pub gem_id: GemId,
    pub previous: GemStatus,
    pub status: GemStatus,
    pub reason: String,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GemEvent {
    GemRegistered(GemRegistered),
    GemReserved(GemReserved),
    ConsignmentReleased(ConsignmentReleased),
    SaleRecorded(SaleRecorded),
    GemRetired(GemRetired),
    StatusOverridden(StatusOverridden),
}

impl GemEvent {
    pub fn gem_id(&self) -> GemId {
        match self {
            GemEvent::GemRegistered(e) => e.gem_id,
            GemEvent::GemReserved(e) => e.gem_id,
            GemEvent::ConsignmentReleased(e) => e.gem_id,
            GemEvent::SaleRecorded(e) => e.gem_id,
            GemEvent::GemRetired(e) => e.gem_id,
            GemEvent::StatusOverridden(e) => e.gem_id,
        }
    }
}

impl Event for GemEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GemEvent::GemRegistered(_) => "inventory.gem.registered",
            GemEvent::GemReserved(_) => "inventory.gem.reserved",
            GemEvent::ConsignmentReleased(_) => "inventory.gem.consignment_released",
            GemEvent::SaleRecorded(_) => "inventory.gem.sale_recorded",
            GemEvent::GemRetired(_) => "inventory.gem.retired",
            GemEvent::StatusOverridden(_) => "inventory.gem.status_overridden",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GemEvent::GemRegistered(e) => e.occurred_at,
            GemEvent::GemReserved(e) => e.occurred_at,
            GemEvent::ConsignmentReleased(e) => e.occurred_at,
            GemEvent::SaleRecorded(e) => e.occurred_at,
            GemEvent::GemRetired(e) => e.occurred_at,
            GemEvent::StatusOverridden(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Gem {
    type Command = GemCommand;
    type Event = GemEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            GemEvent::GemRegistered(e) => {
                self.id = e.gem_id;
                self.stock_id = Some(e.stock_id.clone());
                self.attributes = e.attributes.clone();
                self.cost = e.cost;
                self.price = e.price;
                self.counters = QuantityCounters {
                    in_stock: e.quantity,
                    reserved: 0,
                    sold: 0,
                };
                self.carat = e.carat;
                self.reserved_carat = Decimal::ZERO;
                self.origin = e.origin;
                self.retired = false;
                self.created = true;
                self.refresh_status();
            }
            GemEvent::GemReserved(e) => {
                self.counters.in_stock = self.counters.in_stock.saturating_sub(e.quantity);
                self.counters.reserved += e.quantity;
                self.carat = (self.carat - e.carat).max(Decimal::ZERO);
                self.reserved_carat += e.carat;
                self.refresh_status();
            }
            GemEvent::ConsignmentReleased(e) => {
                self.counters.reserved = self.counters.reserved.saturating_sub(e.quantity);
                self.counters.in_stock += e.quantity;
                self.reserved_carat = (self.reserved_carat - e.carat).max(Decimal::ZERO);
                self.carat += e.carat;
                self.refresh_status();
            }
            GemEvent::SaleRecorded(e) => {
                if e.from_consignment {
                    self.counters.reserved = self.counters.reserved.saturating_sub(e.quantity);
                    self.reserved_carat = (self.reserved_carat - e.carat).max(Decimal::ZERO);
                } else {
                    self.counters.in_stock = self.counters.in_stock.saturating_sub(e.quantity);
                    self.carat = (self.carat - e.carat).max(Decimal::ZERO);
                }
                self.counters.sold += e.quantity;
                self.refresh_status();
            }
            GemEvent::GemRetired(e) => {
                self.counters.in_stock = 0;
                self.counters.sold += e.consumed_quantity;
                self.retired = true;
                self.status = GemStatus::Sold;
            }
            GemEvent::StatusOverridden(e) => {
                self.status = e.status;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            GemCommand::RegisterGem(cmd) => self.handle_register(cmd),
            GemCommand::ReserveForConsignment(cmd) => self.handle_reserve(cmd),
            GemCommand::ReleaseConsignment(cmd) => self.handle_release(cmd),
            GemCommand::RecordSale(cmd) => self.handle_sale(cmd),
            GemCommand::RetireForMergeOrSplit(cmd) => self.handle_retire(cmd),
            GemCommand::OverrideStatus(cmd) => self.handle_override(cmd),
        }
    }
}

impl Gem {
    fn refresh_status(&mut self) {
        self.status = GemStatus::derive(self.counters, self.carat);
    }

    fn ensure_gem_id(&self, gem_id: GemId) -> Result<(), DomainError> {
        if self.id != gem_id {
            return Err(DomainError::invariant("gem_id mismatch"));
        }
        Ok(())
    }

    /// Common preconditions for every command against an existing gem.
    fn ensure_live(&self, gem_id: GemId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("gem {gem_id}")));
        }
        self.ensure_gem_id(gem_id)?;
        if self.retired {
            return Err(DomainError::conflict(format!(
                "gem {} was retired by a merge or split",
                self.display_name()
            )));
        }
        Ok(())
    }

    fn display_name(&self) -> String {
        self.stock_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.id.to_string())
    }

    fn handle_register(&self, cmd: &RegisterGem) -> Result<Vec<GemEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("gem already exists"));
        }
        if cmd.attributes.gem_type.trim().is_empty() {
            return Err(DomainError::validation("gem type cannot be empty"));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        if cmd.carat <= Decimal::ZERO {
            return Err(DomainError::validation("carat must be positive"));
        }
        if cmd.cost < Decimal::ZERO || cmd.price < Decimal::ZERO {
            return Err(DomainError::validation("cost and price cannot be negative"));
        }
        ensure_magnitude("carat", cmd.carat)?;
        ensure_magnitude("cost", cmd.cost)?;
        ensure_magnitude("price", cmd.price)?;

        Ok(vec![GemEvent::GemRegistered(GemRegistered {
            gem_id: cmd.gem_id,
            stock_id: cmd.stock_id.clone(),
            attributes: cmd.attributes.clone(),
            carat: cmd.carat,
            cost: cmd.cost,
            price: cmd.price,
            quantity: cmd.quantity,
            origin: cmd.origin,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveForConsignment) -> Result<Vec<GemEvent>, DomainError> {
        self.ensure_live(cmd.gem_id)?;
        ensure_positive(cmd.quantity, cmd.carat)?;

        if cmd.quantity > self.counters.in_stock {
            return Err(DomainError::validation(format!(
                "cannot reserve {} unit(s) of {}: only {} in stock",
                cmd.quantity,
                self.display_name(),
                self.counters.in_stock
            )));
        }
        if cmd.carat > self.carat {
            return Err(DomainError::validation(format!(
                "cannot reserve {}ct of {}: only {}ct available",
                cmd.carat,
                self.display_name(),
                self.carat
            )));
        }

        Ok(vec![GemEvent::GemReserved(GemReserved {
            gem_id: cmd.gem_id,
            consignment_id: cmd.consignment_id,
            quantity: cmd.quantity,
            carat: cmd.carat,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseConsignment) -> Result<Vec<GemEvent>, DomainError> {
        self.ensure_live(cmd.gem_id)?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.carat < Decimal::ZERO {
            return Err(DomainError::validation("carat cannot be negative"));
        }
        if cmd.quantity > self.counters.reserved {
            return Err(DomainError::invariant(format!(
                "cannot release {} unit(s) of {}: only {} reserved",
                cmd.quantity,
                self.display_name(),
                self.counters.reserved
            )));
        }
        if cmd.carat > self.reserved_carat {
            return Err(DomainError::invariant(format!(
                "cannot release {}ct of {}: only {}ct reserved",
                cmd.carat,
                self.display_name(),
                self.reserved_carat
            )));
        }

        Ok(vec![GemEvent::ConsignmentReleased(ConsignmentReleased {
            gem_id: cmd.gem_id,
            consignment_id: cmd.consignment_id,
            quantity: cmd.quantity,
            carat: cmd.carat,
            outcome: cmd.outcome,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_sale(&self, cmd: &RecordSale) -> Result<Vec<GemEvent>, DomainError> {
        self.ensure_live(cmd.gem_id)?;
        ensure_positive(cmd.quantity, cmd.carat)?;

        let (bucket, available_units, available_carat) = if cmd.from_consignment {
            ("reserved", self.counters.reserved, self.reserved_carat)
        } else {
            ("in stock", self.counters.in_stock, self.carat)
        };

        if cmd.quantity > available_units {
            return Err(DomainError::validation(format!(
                "cannot sell {} unit(s) of {}: only {} {}",
                cmd.quantity,
                self.display_name(),
                available_units,
                bucket
            )));
        }
        if cmd.carat > available_carat {
            return Err(DomainError::validation(format!(
                "cannot sell {}ct of {}: only {}ct {}",
                cmd.carat,
                self.display_name(),
                available_carat,
                bucket
            )));
        }

        Ok(vec![GemEvent::SaleRecorded(SaleRecorded {
            gem_id: cmd.gem_id,
            invoice_id: cmd.invoice_id,
            quantity: cmd.quantity,
            carat: cmd.carat,
            from_consignment: cmd.from_consignment,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_retire(&self, cmd: &RetireForMergeOrSplit) -> Result<Vec<GemEvent>, DomainError> {
        self.ensure_live(cmd.gem_id)?;
        if self.counters.reserved > 0 {
            return Err(DomainError::conflict(format!(
                "gem {} has {} unit(s) out on consignment",
                self.display_name(),
                self.counters.reserved
            )));
        }

        Ok(vec![GemEvent::GemRetired(GemRetired {
            gem_id: cmd.gem_id,
            operation_id: cmd.operation_id,
            kind: cmd.kind,
            consumed_quantity: self.counters.in_stock,
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_override(&self, cmd: &OverrideStatus) -> Result<Vec<GemEvent>, DomainError> {
        self.ensure_live(cmd.gem_id)?;
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("status override requires a reason"));
        }
        if cmd.status == self.status {
            return Ok(vec![]);
        }

        Ok(vec![GemEvent::StatusOverridden(StatusOverridden {
            gem_id: cmd.gem_id,
            previous: self.status,
            status: cmd.status,
            reason: cmd.reason.clone(),
            operator: cmd.operator,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn ensure_positive(quantity: u32, carat: Decimal) -> Result<(), DomainError> {
    if quantity == 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    if carat <= Decimal::ZERO {
        return Err(DomainError::validation("carat must be positive"));
    }
    Ok(())
}
