//! Ledger configuration.
//!
//! Read from the environment:
//!
//! | variable | default | meaning |
//! |---|---|---|
//! | `GEMLEDGER_SPLIT_TOLERANCE` | `0.01` | max difference between a split's portions and its source, per carat/cost/price |
//! | `GEMLEDGER_STOCK_ID_PREFIX` | `GEM` | prefix of generated stock IDs |
//!
//! Invalid values fall back to the default with a warning.

use std::str::FromStr;

use rust_decimal::Decimal;

use gemledger_inventory::StockId;

pub const SPLIT_TOLERANCE_VAR: &str = "GEMLEDGER_SPLIT_TOLERANCE";
pub const STOCK_ID_PREFIX_VAR: &str = "GEMLEDGER_STOCK_ID_PREFIX";

const DEFAULT_STOCK_ID_PREFIX: &str = "GEM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub split_tolerance: Decimal,
    pub stock_id_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            split_tolerance: Decimal::new(1, 2),
            stock_id_prefix: DEFAULT_STOCK_ID_PREFIX.to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let split_tolerance = match lookup(SPLIT_TOLERANCE_VAR) {
            None => defaults.split_tolerance,
            Some(raw) => match Decimal::from_str(raw.trim()) {
                Ok(v) if v >= Decimal::ZERO => v,
                _ => {
                    tracing::warn!(
                        variable = SPLIT_TOLERANCE_VAR,
                        value = %raw,
                        default = %defaults.split_tolerance,
                        "invalid split tolerance; using default"
                    );
                    defaults.split_tolerance
                }
            },
        };

        let stock_id_prefix = match lookup(STOCK_ID_PREFIX_VAR) {
            None => defaults.stock_id_prefix,
            Some(raw) => match valid_prefix(&raw) {
                Some(prefix) => prefix,
                None => {
                    tracing::warn!(
                        variable = STOCK_ID_PREFIX_VAR,
                        value = %raw,
                        default = DEFAULT_STOCK_ID_PREFIX,
                        "invalid stock id prefix; using default"
                    );
                    defaults.stock_id_prefix
                }
            },
        };

        Self {
            split_tolerance,
            stock_id_prefix,
        }
    }

    pub fn with_split_tolerance(mut self, tolerance: Decimal) -> Self {
        self.split_tolerance = tolerance;
        self
    }

    pub fn with_stock_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stock_id_prefix = prefix.into();
        self
    }
}

/// A prefix is valid when a generated code built from it parses as a `StockId`.
fn valid_prefix(raw: &str) -> Option<String> {
    let prefix = raw.trim();
    if prefix.is_empty() {
        return None;
    }
    StockId::parse(&format!("{prefix}-00000000"))
        .ok()
        .map(|_| prefix.to_ascii_uppercase())
}
