//! Infrastructure layer: event store, unit of work, the inventory ledger service and
//! its read side.

pub mod command_dispatcher;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod projections;
pub mod read_model;
pub mod reconcile;
pub mod unit_of_work;

pub use command_dispatcher::{CommandDispatcher, Dispatched};
pub use config::LedgerConfig;
pub use error::LedgerError;
pub use ledger::{
    InventoryLedger, MergeRequest, MergeSplitOutcome, NewConsignment, NewGem, NewInvoice,
    SplitRequest,
};
pub use reconcile::{ReconciliationReport, StatusDiscrepancy};
pub use unit_of_work::{Tracked, UnitOfWork};
