//! Invoicing domain module (event-sourced).
//!
//! Invoice lifecycle and payments only. Stock leaves the ledger when an invoice is
//! created; that effect is staged by the inventory ledger alongside `InvoiceCreated`.

pub mod invoice;

pub use invoice::{
    CancelInvoice, CreateInvoice, Invoice, InvoiceCancelled, InvoiceCommand, InvoiceCreated,
    InvoiceEvent, InvoiceId, InvoiceItem, InvoiceMarkedOverdue, InvoiceSent, InvoiceSource,
    InvoiceStatus, MarkOverdue, MarkSent, PaymentRecorded, RecordPayment,
    INVOICE_AGGREGATE_TYPE,
};
