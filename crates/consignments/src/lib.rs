//! Consignment records (event-sourced).
//!
//! A consignment reserves specific gem quantities and carat against a customer until
//! it is returned, purchased, or converted into an invoice. The quantity effects on
//! the gems themselves are applied by the inventory ledger in the same unit of work.

pub mod consignment;

pub use consignment::{
    Consignment, ConsignmentCommand, ConsignmentCreated, ConsignmentDeactivated,
    ConsignmentDeleted, ConsignmentEvent, ConsignmentId, ConsignmentItem, ConsignmentPurchased,
    ConsignmentReturned, ConsignmentStatus, CreateConsignment, DeactivateConsignment,
    DeleteConsignment, MarkPurchased, MarkReturned, CONSIGNMENT_AGGREGATE_TYPE, line_total,
};
