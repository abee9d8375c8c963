//! # Déboursé Module
//!
//! Cost breakdown of an item: the déboursé lines, their recapitulatif per
//! expense type, and the margin against the item's revenue.
//!
//! ## Line Amount
//! ```text
//! montantHT = round_half_up(quantite × prixUnitaireHT × coefficient)
//!
//! e.g. 10 h × 2 500 × 1.2 = 30 000
//! ```
//!
//! ## Independence From Revenue
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │ Item.totalHT (revenue)       │      │ Item.deboursseSec (cost)     │
//! │ quantite × prixUnitaireHT    │      │ Σ lignesDebourse.montantHT   │
//! └──────────────┬───────────────┘      └───────────────┬──────────────┘
//!                └──────────── marge = revenue − cost ──┘
//! ```
//! Editing déboursé lines never touches the item's revenue. Lines stay
//! editable after validation, until the DQE is converted, refused or archived.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::hierarchy::{new_id, Dqe, Item};
use crate::lifecycle;
use crate::rollup;
use crate::money::{percentage_of, Coefficient, Money, Quantity};
use crate::types::ExpenseType;
use crate::validation::{
    validate_coefficient, validate_label, validate_quantity, validate_unit, validate_unit_price,
};

// =============================================================================
// Lines
// =============================================================================

/// One cost line of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DebourseLine {
    pub id: String,
    #[serde(rename = "typeDepense")]
    pub expense_type: ExpenseType,
    pub designation: String,
    #[serde(rename = "unite")]
    pub unit: String,
    #[serde(rename = "quantite")]
    #[ts(type = "string")]
    pub quantity: Quantity,
    #[serde(rename = "prixUnitaireHT")]
    pub unit_price_ht: Money,
    #[serde(default)]
    #[ts(type = "string")]
    pub coefficient: Coefficient,
    #[serde(rename = "montantHT", default)]
    pub amount_ht: Money,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDebourseLine {
    #[serde(rename = "typeDepense")]
    pub expense_type: ExpenseType,
    pub designation: String,
    #[serde(rename = "unite")]
    pub unit: String,
    #[serde(rename = "quantite")]
    pub quantity: Quantity,
    #[serde(rename = "prixUnitaireHT")]
    pub unit_price_ht: Money,
    /// Defaults to 1.
    #[serde(default)]
    pub coefficient: Option<Coefficient>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebourseLineUpdate {
    #[serde(rename = "typeDepense", default)]
    pub expense_type: Option<ExpenseType>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(rename = "unite", default)]
    pub unit: Option<String>,
    #[serde(rename = "quantite", default)]
    pub quantity: Option<Quantity>,
    #[serde(rename = "prixUnitaireHT", default)]
    pub unit_price_ht: Option<Money>,
    #[serde(default)]
    pub coefficient: Option<Coefficient>,
}

/// Amount of a déboursé line, rounded half-up to the unit.
pub fn line_amount(
    quantity: Quantity,
    unit_price: Money,
    coefficient: Coefficient,
) -> Result<Money, ValidationError> {
    rollup::bounded(
        unit_price.times_quantity_coefficient(quantity, coefficient),
        "montantHT",
    )
}

/// Re-derives the amounts after a change to the lines of item `idx`,
/// putting `previous` back if they no longer fit.
fn refresh_costs(dqe: &mut Dqe, idx: usize, previous: Vec<DebourseLine>) -> CoreResult<()> {
    if let Err(err) = rollup::refresh_totals(dqe) {
        dqe.items[idx].debourse_lines = previous;
        return Err(err.into());
    }
    Ok(())
}

impl Dqe {
    /// Adds a déboursé line to an item and returns its id.
    pub fn create_debourse_line(&mut self, item_id: &str, input: NewDebourseLine) -> CoreResult<String> {
        lifecycle::ensure_costs_editable(self)?;
        let idx = self.item_idx(item_id)?;

        let coefficient = input.coefficient.unwrap_or(Coefficient::ONE);
        validate_label("designation", &input.designation)?;
        validate_unit(&input.unit)?;
        validate_quantity(input.quantity)?;
        validate_unit_price(input.unit_price_ht)?;
        validate_coefficient(coefficient)?;

        let id = new_id();
        let previous = self.items[idx].debourse_lines.clone();
        self.items[idx].debourse_lines.push(DebourseLine {
            id: id.clone(),
            expense_type: input.expense_type,
            designation: input.designation.trim().to_string(),
            unit: input.unit.trim().to_string(),
            quantity: input.quantity,
            unit_price_ht: input.unit_price_ht,
            coefficient,
            amount_ht: Money::zero(),
        });
        refresh_costs(self, idx, previous)?;
        Ok(id)
    }

    pub fn update_debourse_line(
        &mut self,
        item_id: &str,
        line_id: &str,
        update: DebourseLineUpdate,
    ) -> CoreResult<()> {
        lifecycle::ensure_costs_editable(self)?;
        let idx = self.item_idx(item_id)?;

        if let Some(designation) = &update.designation {
            validate_label("designation", designation)?;
        }
        if let Some(unit) = &update.unit {
            validate_unit(unit)?;
        }
        if let Some(quantity) = update.quantity {
            validate_quantity(quantity)?;
        }
        if let Some(price) = update.unit_price_ht {
            validate_unit_price(price)?;
        }
        if let Some(coefficient) = update.coefficient {
            validate_coefficient(coefficient)?;
        }

        let previous = self.items[idx].debourse_lines.clone();
        let line = self.items[idx]
            .debourse_lines
            .iter_mut()
            .find(|line| line.id == line_id)
            .ok_or_else(|| CoreError::not_found("DebourseLine", line_id))?;

        if let Some(expense_type) = update.expense_type {
            line.expense_type = expense_type;
        }
        if let Some(designation) = update.designation {
            line.designation = designation.trim().to_string();
        }
        if let Some(unit) = update.unit {
            line.unit = unit.trim().to_string();
        }
        if let Some(quantity) = update.quantity {
            line.quantity = quantity;
        }
        if let Some(price) = update.unit_price_ht {
            line.unit_price_ht = price;
        }
        if let Some(coefficient) = update.coefficient {
            line.coefficient = coefficient;
        }
        refresh_costs(self, idx, previous)
    }

    pub fn delete_debourse_line(&mut self, item_id: &str, line_id: &str) -> CoreResult<()> {
        lifecycle::ensure_costs_editable(self)?;
        let idx = self.item_idx(item_id)?;

        let previous = self.items[idx].debourse_lines.clone();
        self.items[idx].debourse_lines.retain(|line| line.id != line_id);
        if self.items[idx].debourse_lines.len() == previous.len() {
            return Err(CoreError::not_found("DebourseLine", line_id));
        }
        refresh_costs(self, idx, previous)
    }
}

// =============================================================================
// Recapitulatif
// =============================================================================

/// Subtotal of one expense type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CostBreakdownEntry {
    #[serde(rename = "typeDepense")]
    pub expense_type: ExpenseType,
    #[serde(rename = "sousTotal")]
    pub subtotal: Money,
    /// Share of the déboursé sec, display only.
    #[serde(rename = "pourcentage")]
    pub percentage: f64,
    #[serde(rename = "nombreLignes")]
    pub line_count: u32,
}

/// Breakdown of a set of déboursé lines per expense type.
///
/// Always lists the five expense types, in [`ExpenseType::ALL`] order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Recapitulatif {
    #[serde(rename = "parType")]
    pub entries: Vec<CostBreakdownEntry>,
    #[serde(rename = "deboursseSec")]
    pub total: Money,
}

impl Recapitulatif {
    pub fn entry(&self, expense_type: ExpenseType) -> Option<&CostBreakdownEntry> {
        self.entries.iter().find(|entry| entry.expense_type == expense_type)
    }
}

/// Groups lines by expense type.
///
/// ## Example
/// ```rust
/// use batiplan_core::debourse::{recapitulatif, DebourseLine};
/// use batiplan_core::money::{Coefficient, Money, Quantity};
/// use batiplan_core::types::ExpenseType;
///
/// let line = DebourseLine {
///     id: "l1".to_string(),
///     expense_type: ExpenseType::Labor,
///     designation: "Maçon".to_string(),
///     unit: "h".to_string(),
///     quantity: Quantity::from_units(10),
///     unit_price_ht: Money::from_units(2_500),
///     coefficient: Coefficient::ONE,
///     amount_ht: Money::from_units(25_000),
/// };
/// let recap = recapitulatif(&[line]);
/// assert_eq!(recap.total.units(), 25_000);
/// assert_eq!(recap.entry(ExpenseType::Labor).unwrap().percentage, 100.0);
/// ```
pub fn recapitulatif<'a>(lines: impl IntoIterator<Item = &'a DebourseLine>) -> Recapitulatif {
    let mut subtotals = [Money::zero(); 5];
    let mut counts = [0u32; 5];

    for line in lines {
        let slot = ExpenseType::ALL
            .iter()
            .position(|t| *t == line.expense_type)
            .unwrap_or(ExpenseType::ALL.len() - 1);
        subtotals[slot] += line.amount_ht;
        counts[slot] += 1;
    }

    let total: Money = subtotals.iter().sum();
    let entries = ExpenseType::ALL
        .iter()
        .enumerate()
        .map(|(slot, expense_type)| CostBreakdownEntry {
            expense_type: *expense_type,
            subtotal: subtotals[slot],
            percentage: percentage_of(subtotals[slot], total),
            line_count: counts[slot],
        })
        .collect();

    Recapitulatif { entries, total }
}

// =============================================================================
// Margin
// =============================================================================

/// Revenue against cost for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ItemMargin {
    pub item_id: String,
    #[serde(rename = "totalRevenueHT")]
    pub revenue_ht: Money,
    #[serde(rename = "deboursseSec")]
    pub debourse_sec: Money,
    #[serde(rename = "marge")]
    pub margin: Money,
    /// Margin over revenue in percent; 0 when revenue is 0.
    #[serde(rename = "tauxMarge")]
    pub margin_rate: f64,
}

pub fn item_margin(item: &Item) -> ItemMargin {
    let margin = item.total_ht - item.debourse_sec;
    ItemMargin {
        item_id: item.id.clone(),
        revenue_ht: item.total_ht,
        debourse_sec: item.debourse_sec,
        margin,
        margin_rate: percentage_of(margin, item.total_ht),
    }
}

/// Everything the cost editor shows for one item after a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ItemCostReport {
    #[serde(rename = "poste")]
    pub item: Item,
    pub recapitulatif: Recapitulatif,
    #[serde(rename = "marge")]
    pub margin: ItemMargin,
}

pub fn item_cost_report(dqe: &Dqe, item_id: &str) -> CoreResult<ItemCostReport> {
    let item = dqe
        .item(item_id)
        .ok_or_else(|| CoreError::not_found("Item", item_id))?;
    Ok(ItemCostReport {
        item: item.clone(),
        recapitulatif: recapitulatif(&item.debourse_lines),
        margin: item_margin(item),
    })
}

/// Margin of the whole DQE, from every item's déboursé.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DqeMarginSummary {
    pub dqe_id: String,
    #[serde(rename = "totalRevenueHT")]
    pub revenue_ht: Money,
    #[serde(rename = "deboursseSec")]
    pub debourse_sec: Money,
    #[serde(rename = "marge")]
    pub margin: Money,
    #[serde(rename = "tauxMarge")]
    pub margin_rate: f64,
    /// Items that have at least one déboursé line.
    #[serde(rename = "postesChiffres")]
    pub costed_items: u32,
    pub recapitulatif: Recapitulatif,
}

pub fn dqe_margin_summary(dqe: &Dqe) -> DqeMarginSummary {
    let recap = recapitulatif(dqe.items().flat_map(|item| item.debourse_lines.iter()));
    let revenue = dqe.total_ht();
    let margin = revenue - recap.total;
    DqeMarginSummary {
        dqe_id: dqe.id().to_string(),
        revenue_ht: revenue,
        debourse_sec: recap.total,
        margin,
        margin_rate: percentage_of(margin, revenue),
        costed_items: dqe.items().filter(|item| !item.debourse_lines.is_empty()).count() as u32,
        recapitulatif: recap,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tests::{dqe_with_lot_revenues, now};

    fn labor(hours: i64, rate: i64) -> NewDebourseLine {
        NewDebourseLine {
            expense_type: ExpenseType::Labor,
            designation: "Maçon".to_string(),
            unit: "h".to_string(),
            quantity: Quantity::from_units(hours),
            unit_price_ht: Money::from_units(rate),
            coefficient: None,
        }
    }

    fn first_item_id(dqe: &Dqe) -> String {
        dqe.items().next().unwrap().id.clone()
    }

    #[test]
    fn test_line_amount_with_coefficient() {
        let amount = line_amount(
            Quantity::from_units(10),
            Money::from_units(2_500),
            Coefficient::from_ten_thousandths(12_000),
        );
        assert_eq!(amount.unwrap().units(), 30_000);
    }

    #[test]
    fn test_create_line_updates_debourse_sec_only() {
        let mut dqe = dqe_with_lot_revenues(&[100_000]);
        let item_id = first_item_id(&dqe);

        dqe.create_debourse_line(&item_id, labor(10, 2_500)).unwrap();
        let mut materials = labor(2, 20_000);
        materials.expense_type = ExpenseType::Materials;
        dqe.create_debourse_line(&item_id, materials).unwrap();

        let item = dqe.item(&item_id).unwrap();
        assert_eq!(item.debourse_sec.units(), 65_000);
        assert_eq!(item.total_ht.units(), 100_000);
        assert_eq!(dqe.total_ht().units(), 100_000);

        let margin = item_margin(item);
        assert_eq!(margin.margin.units(), 35_000);
        assert!((margin.margin_rate - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_rejects_zero_coefficient() {
        let mut dqe = dqe_with_lot_revenues(&[100]);
        let item_id = first_item_id(&dqe);
        let mut input = labor(1, 1);
        input.coefficient = Some(Coefficient::from_ten_thousandths(0));
        assert!(dqe.create_debourse_line(&item_id, input).is_err());
        assert!(dqe.item(&item_id).unwrap().debourse_lines.is_empty());
    }

    #[test]
    fn test_update_and_delete_line() {
        let mut dqe = dqe_with_lot_revenues(&[100_000]);
        let item_id = first_item_id(&dqe);
        let line_id = dqe.create_debourse_line(&item_id, labor(10, 2_500)).unwrap();

        dqe.update_debourse_line(
            &item_id,
            &line_id,
            DebourseLineUpdate {
                coefficient: Some(Coefficient::from_ten_thousandths(12_000)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(dqe.item(&item_id).unwrap().debourse_sec.units(), 30_000);

        dqe.delete_debourse_line(&item_id, &line_id).unwrap();
        assert_eq!(dqe.item(&item_id).unwrap().debourse_sec, Money::zero());
        assert!(matches!(
            dqe.delete_debourse_line(&item_id, &line_id),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_lines_editable_after_validation() {
        let mut dqe = dqe_with_lot_revenues(&[100_000]);
        dqe.validate("validator", now()).unwrap();
        let item_id = first_item_id(&dqe);
        assert!(dqe.create_debourse_line(&item_id, labor(1, 1_000)).is_ok());
    }

    #[test]
    fn test_lines_frozen_after_refusal() {
        let mut dqe = dqe_with_lot_revenues(&[100_000]);
        dqe.validate("validator", now()).unwrap();
        dqe.refuse(now()).unwrap();
        let item_id = first_item_id(&dqe);
        assert!(matches!(
            dqe.create_debourse_line(&item_id, labor(1, 1_000)),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_recapitulatif_lists_every_type() {
        let mut dqe = dqe_with_lot_revenues(&[100_000]);
        let item_id = first_item_id(&dqe);
        dqe.create_debourse_line(&item_id, labor(3, 1_000)).unwrap();
        dqe.create_debourse_line(&item_id, labor(1, 1_000)).unwrap();

        let report = item_cost_report(&dqe, &item_id).unwrap();
        assert_eq!(report.recapitulatif.entries.len(), 5);
        let labor_entry = report.recapitulatif.entry(ExpenseType::Labor).unwrap();
        assert_eq!(labor_entry.subtotal.units(), 4_000);
        assert_eq!(labor_entry.line_count, 2);
        assert_eq!(labor_entry.percentage, 100.0);
        let other = report.recapitulatif.entry(ExpenseType::Other).unwrap();
        assert_eq!(other.subtotal, Money::zero());
        assert_eq!(other.percentage, 0.0);
    }

    #[test]
    fn test_margin_rate_zero_revenue() {
        let mut dqe = dqe_with_lot_revenues(&[0]);
        let item_id = first_item_id(&dqe);
        dqe.create_debourse_line(&item_id, labor(1, 500)).unwrap();
        let margin = item_margin(dqe.item(&item_id).unwrap());
        assert_eq!(margin.margin.units(), -500);
        assert_eq!(margin.margin_rate, 0.0);
    }

    #[test]
    fn test_dqe_margin_summary() {
        let mut dqe = dqe_with_lot_revenues(&[10_000, 30_000]);
        let item_ids: Vec<String> = dqe.items().map(|i| i.id.clone()).collect();
        dqe.create_debourse_line(&item_ids[0], labor(4, 1_000)).unwrap();
        dqe.create_debourse_line(&item_ids[1], labor(6, 1_000)).unwrap();

        let summary = dqe_margin_summary(&dqe);
        assert_eq!(summary.debourse_sec.units(), 10_000);
        assert_eq!(summary.margin.units(), 30_000);
        assert!((summary.margin_rate - 75.0).abs() < 1e-9);
        assert_eq!(summary.costed_items, 2);
    }
}
