//! # Rollup Module
//!
//! Bottom-up recomputation of every derived amount in a DQE.
//!
//! ## Calculation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Item.totalHT     = round_half_up(quantite × prixUnitaireHT)            │
//! │        │                                                                │
//! │        ▼  Σ                                                             │
//! │  Chapter.totalHT                                                        │
//! │        │                                                                │
//! │        ▼  Σ                                                             │
//! │  Lot.totalHT ──────────► Lot.pourcentageTotal = Lot / DQE × 100  (f64)  │
//! │        │                                                                │
//! │        ▼  Σ                                                             │
//! │  DQE.totalRevenueHT                                                     │
//! │        ├── montantTVA      = round_half_up(totalHT × tauxTVA)           │
//! │        └── totalRevenueTTC = totalHT + montantTVA                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sums are exact integer additions; the only rounding step is the item
//! product and the tax. Percentages are kept unrounded and never feed a
//! monetary value.

use crate::debourse::line_amount;
use crate::error::{CoreResult, ValidationError};
use crate::hierarchy::Dqe;
use crate::money::{percentage_of, Money};
use crate::MAX_AMOUNT;

/// Recomputes every total of `dqe` and returns the updated copy.
///
/// Strict: fails on a lot without chapter, a chapter without item, a
/// non-positive quantity or a negative price. The input is left untouched.
pub fn recompute_totals(dqe: &Dqe) -> CoreResult<Dqe> {
    check_structure(dqe)?;
    let mut next = dqe.clone();
    refresh_totals(&mut next)?;
    Ok(next)
}

/// Structural checks run before validation.
pub fn check_structure(dqe: &Dqe) -> Result<(), ValidationError> {
    let topology = &dqe.topology;
    for &lot_idx in &topology.lot_order {
        let lot = &dqe.lots[lot_idx];
        let chapters = &topology.lot_chapters[lot_idx];
        if chapters.is_empty() {
            return Err(ValidationError::EmptyLot {
                lot_id: lot.id.clone(),
                code: lot.code.clone(),
            });
        }

        for &chapter_idx in chapters {
            let chapter = &dqe.chapters[chapter_idx];
            let items = &topology.chapter_items[chapter_idx];
            if items.is_empty() {
                return Err(ValidationError::EmptyChapter {
                    chapter_id: chapter.id.clone(),
                    code: chapter.code.clone(),
                });
            }

            for &item_idx in items {
                let item = &dqe.items[item_idx];
                if !item.quantity.is_positive() {
                    return Err(ValidationError::NonPositiveQuantity {
                        item_id: item.id.clone(),
                        code: item.code.clone(),
                    });
                }
                if item.unit_price_ht.is_negative() {
                    return Err(ValidationError::NegativePrice {
                        item_id: item.id.clone(),
                        code: item.code.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Refreshes every derived field in place.
///
/// Lenient: empty lots and chapters simply total zero. Requires a topology
/// built from the current arenas. Every amount is checked against
/// [`MAX_AMOUNT`]; on failure nothing is written.
pub(crate) fn refresh_totals(dqe: &mut Dqe) -> Result<(), ValidationError> {
    debug_assert_eq!(dqe.topology.chapter_items.len(), dqe.chapters.len());
    debug_assert_eq!(dqe.topology.lot_chapters.len(), dqe.lots.len());

    let mut item_totals = Vec::with_capacity(dqe.items.len());
    let mut item_costs = Vec::with_capacity(dqe.items.len());
    let mut debourse_total = Money::zero();
    for item in &dqe.items {
        item_totals.push(bounded(
            item.unit_price_ht.times_quantity(item.quantity),
            "totalRevenueHT",
        )?);
        let amounts = item
            .debourse_lines
            .iter()
            .map(|line| line_amount(line.quantity, line.unit_price_ht, line.coefficient))
            .collect::<Result<Vec<_>, _>>()?;
        let debourse_sec = sum_bounded(amounts.iter().copied(), "deboursseSec")?;
        debourse_total = bounded(debourse_total.checked_add(debourse_sec), "deboursseSec")?;
        item_costs.push((amounts, debourse_sec));
    }

    let chapter_totals = dqe
        .topology
        .chapter_items
        .iter()
        .map(|items| sum_bounded(items.iter().map(|&item| item_totals[item]), "totalRevenueHT"))
        .collect::<Result<Vec<_>, _>>()?;
    let lot_totals = dqe
        .topology
        .lot_chapters
        .iter()
        .map(|chapters| {
            sum_bounded(chapters.iter().map(|&chapter| chapter_totals[chapter]), "totalRevenueHT")
        })
        .collect::<Result<Vec<_>, _>>()?;

    let total = sum_bounded(lot_totals.iter().copied(), "totalRevenueHT")?;
    let vat_amount = bounded(total.calculate_tax(dqe.header.vat_rate), "montantTVA")?;
    let total_ttc = bounded(total.checked_add(vat_amount), "totalRevenueTTC")?;

    for ((item, total_ht), (amounts, debourse_sec)) in
        dqe.items.iter_mut().zip(item_totals).zip(item_costs)
    {
        item.total_ht = total_ht;
        for (line, amount) in item.debourse_lines.iter_mut().zip(amounts) {
            line.amount_ht = amount;
        }
        item.debourse_sec = debourse_sec;
    }
    for (chapter, total_ht) in dqe.chapters.iter_mut().zip(chapter_totals) {
        chapter.total_ht = total_ht;
    }
    for (lot, total_ht) in dqe.lots.iter_mut().zip(lot_totals) {
        lot.total_ht = total_ht;
        lot.percentage_of_total = percentage_of(total_ht, total);
    }

    let header = &mut dqe.header;
    header.total_ht = total;
    header.vat_amount = vat_amount;
    header.total_ttc = total_ttc;
    Ok(())
}

/// `amount` if it exists and stays within [`MAX_AMOUNT`].
pub(crate) fn bounded(amount: Option<Money>, field: &str) -> Result<Money, ValidationError> {
    match amount {
        Some(amount) if amount.units().unsigned_abs() <= MAX_AMOUNT as u64 => Ok(amount),
        _ => Err(ValidationError::AmountTooLarge {
            field: field.to_string(),
            max: MAX_AMOUNT,
        }),
    }
}

fn sum_bounded(
    mut amounts: impl Iterator<Item = Money>,
    field: &str,
) -> Result<Money, ValidationError> {
    amounts.try_fold(Money::zero(), |sum, amount| bounded(sum.checked_add(amount), field))
}

// =============================================================================
// Unit Tests
// =============================================================================
