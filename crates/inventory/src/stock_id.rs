//! Human-readable stock codes.
//!
//! A `StockId` is unique across the ledger and never changes once assigned. The
//! infrastructure layer enforces uniqueness by appending a `StockIdClaimed` event to a
//! stream whose id is derived from the code itself (`claim_key`), expecting the stream
//! to be empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gemledger_core::{AggregateId, DomainError, OperatorId};
use gemledger_events::Event;

use crate::gem::GemId;

/// Aggregate type of the per-code claim streams.
pub const STOCK_ID_AGGREGATE_TYPE: &str = "inventory.stock_id";

const MAX_LEN: usize = 32;

/// Namespace for deriving claim stream ids from stock codes (UUIDv5).
const CLAIM_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_2f7e_58a4_4b0e_9a53_0c2b_7e41_d9f3);

/// Validated, upper-cased stock code (e.g. `GEM-1A2B3C4D`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StockId(String);

impl StockId {
    /// Parse and normalise a stock code.
    ///
    /// Accepts 1..=32 characters from `[A-Za-z0-9._-]`; surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("StockId: cannot be empty"));
        }
        if trimmed.len() > MAX_LEN {
            return Err(DomainError::invalid_id(format!(
                "StockId: longer than {MAX_LEN} characters"
            )));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DomainError::invalid_id(format!(
                "StockId: unexpected character {bad:?}"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Mint a fresh code `{prefix}-{8 hex}` from the random tail of a UUIDv7.
    pub fn generate(prefix: &str) -> Result<Self, DomainError> {
        let simple = Uuid::now_v7().simple().to_string();
        let suffix = &simple[simple.len() - 8..];
        Self::parse(&format!("{prefix}-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream id that holds the claim for this code.
    pub fn claim_key(&self) -> AggregateId {
        AggregateId::from_uuid(Uuid::new_v5(&CLAIM_NAMESPACE, self.0.as_bytes()))
    }
}

impl core::fmt::Display for StockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StockId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StockId> for String {
    fn from(value: StockId) -> Self {
        value.0
    }
}

impl core::str::FromStr for StockId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Event: StockIdClaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockIdClaimed {
    pub stock_id: StockId,
    pub gem_id: GemId,
    pub operator: OperatorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockIdEvent {
    StockIdClaimed(StockIdClaimed),
}

impl Event for StockIdEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockIdEvent::StockIdClaimed(_) => "inventory.stock_id.claimed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockIdEvent::StockIdClaimed(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises_case_and_whitespace() {
        let id = StockId::parse("  em-0042 ").unwrap();
        assert_eq!(id.as_str(), "EM-0042");
    }

    #[test]
    fn parse_rejects_spaces_and_symbols() {
        assert!(StockId::parse("EM 0042").is_err());
        assert!(StockId::parse("EM/0042").is_err());
        assert!(StockId::parse("").is_err());
        assert!(StockId::parse(&"X".repeat(33)).is_err());
    }

    #[test]
    fn generated_codes_carry_prefix() {
        let id = StockId::generate("gem").unwrap();
        assert!(id.as_str().starts_with("GEM-"));
        assert_eq!(id.as_str().len(), "GEM-".len() + 8);
    }

    #[test]
    fn claim_key_is_stable_per_code() {
        let a = StockId::parse("dia-7").unwrap();
        let b = StockId::parse("DIA-7").unwrap();
        let c = StockId::parse("DIA-8").unwrap();
        assert_eq!(a.claim_key(), b.claim_key());
        assert_ne!(a.claim_key(), c.claim_key());
    }

    #[test]
    fn deserialization_validates() {
        let err = serde_json::from_str::<StockId>("\"bad code\"");
        assert!(err.is_err());
    }
}
