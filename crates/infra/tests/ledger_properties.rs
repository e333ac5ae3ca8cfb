//! Quantity, carat and value properties of the inventory ledger, exercised through
//! the public `InventoryLedger` surface against the in-memory store.

mod common;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use gemledger_events::EventBus;
use gemledger_infra::{MergeRequest, SplitRequest};
use gemledger_inventory::{GemStatus, SplitPortion};

use common::*;

#[test]
fn counters_sum_to_initial_quantity_through_a_workflow() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 5, dec!(10.0))?;
    let gem_id = gem.id_typed();
    assert_eq!(total_units(&gem), 5);

    let first = consign(&ledger, &[(gem_id, 2, dec!(2.0))])?;
    assert_eq!(total_units(&ledger.gem(gem_id)?), 5);

    sell(&ledger, &[(gem_id, 1, dec!(1.0))])?;
    assert_eq!(total_units(&ledger.gem(gem_id)?), 5);

    let second = consign(&ledger, &[(gem_id, 1, dec!(1.0))])?;
    ledger.return_consignment(first.id_typed(), operator())?;
    ledger.purchase_consignment(second.id_typed(), due_date(), operator())?;

    let gem = ledger.gem(gem_id)?;
    assert_eq!(total_units(&gem), 5);
    assert_eq!(gem.in_stock(), 3);
    assert_eq!(gem.reserved(), 0);
    assert_eq!(gem.sold(), 2);
    Ok(())
}

#[derive(Debug, Clone)]
enum Step {
    Consign(u32),
    Sell(u32),
    ReturnOldest,
    PurchaseOldest,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1u32..3).prop_map(Step::Consign),
        (1u32..3).prop_map(Step::Sell),
        Just(Step::ReturnOldest),
        Just(Step::PurchaseOldest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Rejected steps are fine; whatever is accepted must keep the counters whole.
    #[test]
    fn counters_are_conserved_under_any_sequence(steps in prop::collection::vec(step(), 1..12)) {
        let (ledger, _bus) = ledger();
        let gem = register(&ledger, 6, dec!(12.0)).unwrap();
        let gem_id = gem.id_typed();
        let mut pending = Vec::new();

        for s in steps {
            match s {
                Step::Consign(q) => {
                    if let Ok(c) = consign(&ledger, &[(gem_id, q, Decimal::from(q))]) {
                        pending.push(c.id_typed());
                    }
                }
                Step::Sell(q) => {
                    let _ = sell(&ledger, &[(gem_id, q, Decimal::from(q))]);
                }
                Step::ReturnOldest => {
                    if !pending.is_empty() {
                        let id = pending.remove(0);
                        ledger.return_consignment(id, operator()).unwrap();
                    }
                }
                Step::PurchaseOldest => {
                    if !pending.is_empty() {
                        let id = pending.remove(0);
                        ledger.purchase_consignment(id, due_date(), operator()).unwrap();
                    }
                }
            }

            let gem = ledger.gem(gem_id).unwrap();
            prop_assert_eq!(total_units(&gem), 6);
            prop_assert!(gem.carat() >= Decimal::ZERO);
            prop_assert_eq!(gem.carat() + gem.reserved_carat() + Decimal::from(gem.sold()), dec!(12.0));
            prop_assert_eq!(gem.status(), gem.derived_status());
        }
    }
}

#[test]
fn status_follows_counters() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 2, dec!(4.0))?;
    let gem_id = gem.id_typed();
    assert_eq!(gem.status(), GemStatus::InStock);

    let consignment = consign(&ledger, &[(gem_id, 2, dec!(1.0))])?;
    let gem = ledger.gem(gem_id)?;
    assert_eq!((gem.in_stock(), gem.reserved()), (0, 2));
    assert_eq!(gem.status(), GemStatus::Reserved);

    ledger.purchase_consignment(consignment.id_typed(), due_date(), operator())?;
    let gem = ledger.gem(gem_id)?;
    assert_eq!((gem.in_stock(), gem.reserved(), gem.sold()), (0, 0, 2));
    assert_eq!(gem.status(), GemStatus::Sold);
    Ok(())
}

#[test]
fn merge_sums_carat_cost_and_price() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let a = ledger.register_gem(new_gem("Ruby", 1, dec!(2.0), dec!(400), dec!(1000)), operator())?;
    let b = ledger.register_gem(new_gem("Ruby", 1, dec!(3.5), dec!(700), dec!(2000)), operator())?;

    let outcome = ledger.merge_gems(
        MergeRequest {
            sources: vec![a.id_typed(), b.id_typed()],
            stock_id: None,
            attributes: None,
            notes: Some("matched pair".to_string()),
        },
        operator(),
    )?;

    assert_eq!(outcome.created.len(), 1);
    let merged = ledger.gem(outcome.created[0].id_typed())?;
    assert_eq!(merged.carat(), dec!(5.5));
    assert_eq!(merged.cost(), dec!(1100));
    assert_eq!(merged.price(), dec!(3000));
    assert_eq!(merged.in_stock(), 1);
    assert_eq!(merged.attributes().gem_type, "Ruby");

    for source in [a.id_typed(), b.id_typed()] {
        let gem = ledger.gem(source)?;
        assert_eq!(gem.in_stock(), 0);
        assert_eq!(gem.sold(), 1);
        assert_eq!(gem.status(), GemStatus::Sold);
        assert!(gem.is_retired());
    }

    assert_eq!(outcome.record.before, outcome.record.after);
    assert_eq!(outcome.record.sources.len(), 2);
    Ok(())
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
fn split_portions_sum_back_to_source() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let source = ledger.register_gem(new_gem("Emerald", 1, dec!(3.0), dec!(900), dec!(1800)), operator())?;

    let outcome = ledger.split_gem(
        SplitRequest {
            source: source.id_typed(),
            portions: vec![
                portion(dec!(1.0), dec!(300), dec!(600)),
                portion(dec!(2.0), dec!(600), dec!(1200)),
            ],
            notes: None,
        },
        operator(),
    )?;

    assert_eq!(outcome.created.len(), 2);
    let carat: Decimal = outcome.created.iter().map(|g| g.carat()).sum();
    let cost: Decimal = outcome.created.iter().map(|g| g.cost()).sum();
    let price: Decimal = outcome.created.iter().map(|g| g.price()).sum();
    assert_eq!((carat, cost, price), (dec!(3.0), dec!(900), dec!(1800)));
    assert!(outcome.created.iter().all(|g| g.in_stock() == 1));

    let retired = ledger.gem(source.id_typed())?;
    assert_eq!(retired.status(), GemStatus::Sold);
    assert_eq!(retired.in_stock(), 0);
    Ok(())
}

#[test]
fn split_within_tolerance_is_accepted() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let source = ledger.register_gem(new_gem("Emerald", 1, dec!(3.0), dec!(900), dec!(1800)), operator())?;

    ledger.split_gem(
        SplitRequest {
            source: source.id_typed(),
            portions: vec![
                portion(dec!(1.005), dec!(300), dec!(600)),
                portion(dec!(2.0), dec!(600.01), dec!(1199.99)),
            ],
            notes: None,
        },
        operator(),
    )?;
    Ok(())
}

#[test]
fn unbalanced_split_is_rejected_without_writes() -> anyhow::Result<()> {
    let (ledger, bus) = ledger();
    let source = ledger.register_gem(new_gem("Emerald", 1, dec!(3.0), dec!(900), dec!(1800)), operator())?;
    let sub = bus.subscribe();

    let err = ledger
        .split_gem(
            SplitRequest {
                source: source.id_typed(),
                portions: vec![
                    portion(dec!(1.0), dec!(300), dec!(600)),
                    portion(dec!(1.5), dec!(600), dec!(1200)),
                ],
                notes: None,
            },
            operator(),
        )
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(ledger.gem(source.id_typed())?, source);
    assert_eq!(ledger.gems()?.len(), 1);
    assert!(ledger.merge_split_history()?.is_empty());
    assert!(sub.drain().is_empty());
    Ok(())
}

#[test]
fn split_overshooting_source_carat_is_rejected() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let source = ledger.register_gem(new_gem("Sapphire", 1, dec!(5.5), dec!(2000), dec!(3000)), operator())?;

    let err = ledger
        .split_gem(
            SplitRequest {
                source: source.id_typed(),
                portions: vec![
                    portion(dec!(2.0), dec!(700), dec!(1000)),
                    portion(dec!(3.6), dec!(1300), dec!(2000)),
                ],
                notes: None,
            },
            operator(),
        )
        .unwrap_err();

    assert!(err.is_validation());
    let unchanged = ledger.gem(source.id_typed())?;
    assert_eq!(unchanged, source);
    assert_eq!(unchanged.carat(), dec!(5.5));
    assert!(!unchanged.is_retired());
    assert!(ledger.merge_split_history()?.is_empty());
    Ok(())
}

#[test]
fn consignment_round_trip_restores_stock_and_carat() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 1, dec!(2.0))?;
    let gem_id = gem.id_typed();

    let consignment = consign(&ledger, &[(gem_id, 1, dec!(1.0))])?;
    let out = ledger.gem(gem_id)?;
    assert_eq!((out.in_stock(), out.reserved()), (0, 1));
    assert_eq!(out.status(), GemStatus::Reserved);
    assert_eq!(out.carat(), dec!(1.0));

    ledger.return_consignment(consignment.id_typed(), operator())?;
    let back = ledger.gem(gem_id)?;
    assert_eq!((back.in_stock(), back.reserved()), (1, 0));
    assert_eq!(back.status(), GemStatus::InStock);
    assert_eq!(back.carat(), dec!(2.0));
    assert_eq!(back.reserved_carat(), dec!(0));
    Ok(())
}

#[test]
fn reserving_three_of_ten_returns_or_sells_exactly_three() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 10, dec!(20.0))?;
    let gem_id = gem.id_typed();

    let returned = consign(&ledger, &[(gem_id, 3, dec!(6.0))])?;
    let out = ledger.gem(gem_id)?;
    assert_eq!((out.in_stock(), out.reserved(), out.sold()), (7, 3, 0));

    ledger.return_consignment(returned.id_typed(), operator())?;
    let back = ledger.gem(gem_id)?;
    assert_eq!((back.in_stock(), back.reserved(), back.sold()), (10, 0, 0));

    let purchased = consign(&ledger, &[(gem_id, 3, dec!(6.0))])?;
    ledger.purchase_consignment(purchased.id_typed(), due_date(), operator())?;
    let sold = ledger.gem(gem_id)?;
    assert_eq!((sold.in_stock(), sold.reserved(), sold.sold()), (7, 0, 3));
    assert_eq!(sold.status(), GemStatus::InStock);
    Ok(())
}

#[test]
fn direct_sale_draws_from_stock() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 3, dec!(6.0))?;
    let gem_id = gem.id_typed();

    sell(&ledger, &[(gem_id, 1, dec!(2.0))])?;
    let after = ledger.gem(gem_id)?;
    assert_eq!((after.in_stock(), after.reserved(), after.sold()), (2, 0, 1));
    assert_eq!(after.carat(), dec!(4.0));
    Ok(())
}

#[test]
fn consignment_sale_draws_from_reserved() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 3, dec!(6.0))?;
    let gem_id = gem.id_typed();

    let consignment = consign(&ledger, &[(gem_id, 1, dec!(2.0))])?;
    ledger.purchase_consignment(consignment.id_typed(), due_date(), operator())?;

    let after = ledger.gem(gem_id)?;
    assert_eq!((after.in_stock(), after.reserved(), after.sold()), (2, 0, 1));
    // The consigned carat left `carat` once, at reservation.
    assert_eq!(after.carat(), dec!(4.0));
    assert_eq!(after.reserved_carat(), dec!(0));
    Ok(())
}

#[test]
fn full_carat_depletion_forces_sold() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 2, dec!(1.0))?;
    let gem_id = gem.id_typed();

    sell(&ledger, &[(gem_id, 1, dec!(1.0))])?;
    let after = ledger.gem(gem_id)?;
    assert_eq!(after.in_stock(), 1);
    assert_eq!(after.carat(), dec!(0));
    assert_eq!(after.status(), GemStatus::Sold);
    Ok(())
}

#[test]
fn consigning_the_whole_stone_forces_sold() -> anyhow::Result<()> {
    let (ledger, _bus) = ledger();
    let gem = register(&ledger, 1, dec!(1.5))?;
    let gem_id = gem.id_typed();

    let consignment = consign(&ledger, &[(gem_id, 1, dec!(1.5))])?;
    assert_eq!(ledger.gem(gem_id)?.status(), GemStatus::Sold);

    ledger.return_consignment(consignment.id_typed(), operator())?;
    let back = ledger.gem(gem_id)?;
    assert_eq!(back.status(), GemStatus::InStock);
    assert_eq!(back.carat(), dec!(1.5));
    Ok(())
}
