//! Merge/split arithmetic and the audit record they leave behind.
//!
//! Both operations retire their source gems and mint replacements; total carat, cost
//! and sale price are conserved across the set. Everything here is validation and
//! arithmetic; the ledger stages the resulting commands in one unit of work.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use gemledger_core::{AggregateId, DomainError, OperatorId};
use gemledger_events::Event;

use crate::gem::{ensure_magnitude, Gem, GemAttributes, GemId};
use crate::stock_id::StockId;

/// Aggregate type of audit record streams (one stream per operation).
pub const MERGE_SPLIT_AGGREGATE_TYPE: &str = "inventory.merge_split";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSplitKind {
    Merge,
    Split,
}

/// Carat, cost and sale price of one or more stones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    pub carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
}

impl Valuation {
    pub fn of(gem: &Gem) -> Self {
        Self {
            carat: gem.carat(),
            cost: gem.cost(),
            price: gem.price(),
        }
    }

    pub fn checked_add(&self, rhs: &Valuation) -> Option<Valuation> {
        Some(Valuation {
            carat: self.carat.checked_add(rhs.carat)?,
            cost: self.cost.checked_add(rhs.cost)?,
            price: self.price.checked_add(rhs.price)?,
        })
    }

    /// Combined valuation of several stones; overflow is a validation error.
    pub fn total(parts: impl IntoIterator<Item = Valuation>) -> Result<Valuation, DomainError> {
        parts
            .into_iter()
            .try_fold(Valuation::default(), |acc, v| acc.checked_add(&v))
            .ok_or_else(|| DomainError::validation("combined carat, cost or price is out of range"))
    }

    /// True when every component differs by at most `tolerance`.
    pub fn reconciles_with(&self, other: &Valuation, tolerance: Decimal) -> bool {
        (self.carat - other.carat).abs() <= tolerance
            && (self.cost - other.cost).abs() <= tolerance
            && (self.price - other.price).abs() <= tolerance
    }
}

/// One output stone of a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPortion {
    pub carat: Decimal,
    pub cost: Decimal,
    pub price: Decimal,
    /// Stock code for the new gem; generated when absent.
    pub stock_id: Option<StockId>,
    /// Descriptors for the new gem; copied from the source when absent.
    pub attributes: Option<GemAttributes>,
}

impl SplitPortion {
    pub fn valuation(&self) -> Valuation {
        Valuation {
            carat: self.carat,
            cost: self.cost,
            price: self.price,
        }
    }
}

/// A gem can feed a merge or split only if it is live, fully back from consignment
/// and still has carat to give.
pub fn ensure_consumable(gem: &Gem) -> Result<(), DomainError> {
    if !gem.is_created() {
        return Err(DomainError::not_found(format!("gem {}", gem.id_typed())));
    }
    let name = gem
        .stock_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| gem.id_typed().to_string());
    if gem.is_retired() {
        return Err(DomainError::conflict(format!(
            "gem {name} was already consumed by a merge or split"
        )));
    }
    if gem.reserved() > 0 {
        return Err(DomainError::conflict(format!(
            "gem {name} has {} unit(s) out on consignment",
            gem.reserved()
        )));
    }
    if gem.carat() <= Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "gem {name} has no carat left"
        )));
    }
    Ok(())
}

/// Valuation of the single gem produced by merging `sources`.
pub fn merged_valuation(sources: &[&Gem]) -> Result<Valuation, DomainError> {
    if sources.len() < 2 {
        return Err(DomainError::validation("a merge needs at least two source gems"));
    }
    let mut seen: Vec<GemId> = Vec::with_capacity(sources.len());
    for gem in sources {
        if seen.contains(&gem.id_typed()) {
            return Err(DomainError::validation(format!(
                "gem {} appears more than once in the merge",
                gem.id_typed()
            )));
        }
        seen.push(gem.id_typed());
        ensure_consumable(gem)?;
    }
    Valuation::total(sources.iter().map(|g| Valuation::of(g)))
}

/// Check that `portions` add back up to `source` within `tolerance`.
///
/// Returns the portions' combined valuation. Runs before anything is staged, so a
/// rejected split leaves the source untouched.
pub fn validate_split(
    source: &Gem,
    portions: &[SplitPortion],
    tolerance: Decimal,
) -> Result<Valuation, DomainError> {
    ensure_consumable(source)?;
    if portions.len() < 2 {
        return Err(DomainError::validation("a split needs at least two portions"));
    }
    for (idx, p) in portions.iter().enumerate() {
        if p.carat <= Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "portion {} must have positive carat",
                idx + 1
            )));
        }
        if p.cost < Decimal::ZERO || p.price < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "portion {} cannot have negative cost or price",
                idx + 1
            )));
        }
        ensure_magnitude("portion carat", p.carat)?;
        ensure_magnitude("portion cost", p.cost)?;
        ensure_magnitude("portion price", p.price)?;
    }

    let before = Valuation::of(source);
    let after = Valuation::total(portions.iter().map(SplitPortion::valuation))?;
    if !after.reconciles_with(&before, tolerance) {
        return Err(DomainError::validation(format!(
            "split portions do not reconcile with source (carat {} vs {}, cost {} vs {}, price {} vs {}, tolerance {})",
            after.carat, before.carat, after.cost, before.cost, after.price, before.price, tolerance
        )));
    }
    Ok(after)
}

/// A gem referenced by an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemRef {
    pub gem_id: GemId,
    pub stock_id: StockId,
}

/// Event: MergeSplitRecorded (immutable audit entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSplitRecorded {
    pub operation_id: AggregateId,
    pub kind: MergeSplitKind,
    pub sources: Vec<GemRef>,
    pub outputs: Vec<GemRef>,
    pub before: Valuation,
    pub after: Valuation,
    pub operator: OperatorId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeSplitEvent {
    MergeSplitRecorded(MergeSplitRecorded),
}

impl Event for MergeSplitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MergeSplitEvent::MergeSplitRecorded(e) => match e.kind {
                MergeSplitKind::Merge => "inventory.merge_split.merged",
                MergeSplitKind::Split => "inventory.merge_split.split",
            },
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MergeSplitEvent::MergeSplitRecorded(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gem::{GemCommand, GemOrigin, RegisterGem};
    use gemledger_core::Aggregate;
    use rust_decimal_macros::dec;

    fn gem(carat: Decimal, cost: Decimal, price: Decimal) -> Gem {
        let gem_id = GemId::new(AggregateId::new());
        let mut gem = Gem::empty(gem_id);
        let cmd = RegisterGem {
            gem_id,
            stock_id: StockId::generate("T").unwrap(),
            attributes: GemAttributes {
                gem_type: "Diamond".to_string(),
                ..GemAttributes::default()
            },
            carat,
            cost,
            price,
            quantity: 1,
            origin: GemOrigin::Manual,
            operator: OperatorId::new(),
            occurred_at: Utc::now(),
        };
        for e in gem.handle(&GemCommand::RegisterGem(cmd)).unwrap() {
            gem.apply(&e);
        }
        gem
    }

    fn portion(carat: Decimal, cost: Decimal, price: Decimal) -> SplitPortion {
        SplitPortion {
            carat,
            cost,
            price,
            stock_id: None,
            attributes: None,
        }
    }

    #[test]
    fn merge_sums_carat_cost_and_price() {
        let a = gem(dec!(2.0), dec!(600), dec!(1000));
        let b = gem(dec!(3.5), dec!(1400), dec!(2000));
        let merged = merged_valuation(&[&a, &b]).unwrap();
        assert_eq!(merged.carat, dec!(5.5));
        assert_eq!(merged.cost, dec!(2000));
        assert_eq!(merged.price, dec!(3000));
    }

    #[test]
    fn merge_needs_two_distinct_sources() {
        let a = gem(dec!(1), dec!(1), dec!(1));
        assert!(merged_valuation(&[&a]).is_err());
        let err = merged_valuation(&[&a, &a]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("more than once")));
    }

    #[test]
    fn balanced_split_is_accepted() {
        let source = gem(dec!(5.5), dec!(2000), dec!(3000));
        let portions = [
            portion(dec!(2.0), dec!(700), dec!(1000)),
            portion(dec!(3.5), dec!(1300), dec!(2000)),
        ];
        let after = validate_split(&source, &portions, dec!(0.01)).unwrap();
        assert_eq!(after, Valuation::of(&source));
    }

    #[test]
    fn split_within_tolerance_is_accepted() {
        let source = gem(dec!(1.00), dec!(100), dec!(200));
        let portions = [
            portion(dec!(0.33), dec!(33.33), dec!(66.66)),
            portion(dec!(0.66), dec!(66.66), dec!(133.33)),
        ];
        assert!(validate_split(&source, &portions, dec!(0.01)).is_ok());
    }

    #[test]
    fn imbalanced_split_is_rejected() {
        let source = gem(dec!(5.5), dec!(2000), dec!(3000));
        let portions = [
            portion(dec!(2.0), dec!(700), dec!(1000)),
            portion(dec!(3.6), dec!(1300), dec!(2000)),
        ];
        let err = validate_split(&source, &portions, dec!(0.01)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("do not reconcile")));
    }

    #[test]
    fn split_rejects_empty_portion() {
        let source = gem(dec!(2), dec!(10), dec!(10));
        let portions = [
            portion(dec!(2), dec!(10), dec!(10)),
            portion(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
        ];
        assert!(validate_split(&source, &portions, dec!(0.01)).is_err());
    }

    #[test]
    fn oversized_portions_are_rejected_without_overflow() {
        let source = gem(dec!(5.5), dec!(2000), dec!(3000));
        let portions = [
            portion(Decimal::MAX, dec!(1000), dec!(1500)),
            portion(Decimal::MAX, dec!(1000), dec!(1500)),
        ];
        let err = validate_split(&source, &portions, dec!(0.01)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("portion carat")));
    }

    #[test]
    fn valuation_total_reports_overflow() {
        let huge = Valuation {
            carat: dec!(1),
            cost: Decimal::MAX,
            price: dec!(1),
        };
        let err = Valuation::total([huge, huge]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let small = Valuation {
            carat: dec!(1.5),
            cost: dec!(10),
            price: dec!(20),
        };
        let sum = Valuation::total([small, small, small]).unwrap();
        assert_eq!((sum.carat, sum.cost, sum.price), (dec!(4.5), dec!(30), dec!(60)));
    }
}
