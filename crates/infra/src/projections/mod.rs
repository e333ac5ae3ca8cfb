//! Projections (read model builders).
//!
//! Projections consume published envelopes and build query-optimized read models.
//! They are rebuildable from the event stream and idempotent under at-least-once
//! delivery.

pub mod gem_catalog;

pub use gem_catalog::{GemCatalogEntry, GemCatalogError, GemCatalogProjection};
