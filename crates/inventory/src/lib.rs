//! Gem inventory ledger (event-sourced).
//!
//! The `Gem` aggregate owns the quantity counters (`in_stock` / `reserved` / `sold`),
//! the remaining carat and the derived status. Merge/split planning and stock-ID
//! handling live beside it. Pure domain logic: no IO, no storage.

pub mod gem;
pub mod merge_split;
pub mod stock_id;

pub use gem::{
    ConsignmentReleased, GemAttributes, GemCommand, GemEvent, GemId, GemOrigin, GemRegistered,
    GemReserved, GemRetired, GemStatus, Gem, OverrideStatus, QuantityCounters, RecordSale,
    RegisterGem, ReleaseConsignment, ReleaseOutcome, ReserveForConsignment,
    RetireForMergeOrSplit, SaleRecorded, StatusOverridden, GEM_AGGREGATE_TYPE, MAX_MAGNITUDE,
    ensure_magnitude,
};
pub use merge_split::{
    GemRef, MergeSplitEvent, MergeSplitKind, MergeSplitRecorded, SplitPortion, Valuation,
    MERGE_SPLIT_AGGREGATE_TYPE, ensure_consumable, merged_valuation, validate_split,
};
pub use stock_id::{StockId, StockIdClaimed, StockIdEvent, STOCK_ID_AGGREGATE_TYPE};
