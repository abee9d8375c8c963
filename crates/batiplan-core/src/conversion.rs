//! # Conversion Module
//!
//! Turns a validated DQE into a project plan: one stage per lot, with a
//! budget and a date window each.
//!
//! ## Allocation Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  can_convert ── statut = valide, not converted, totalHT > 0             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  raw durations                                                          │
//! │   ├── proportionnel  round_half_up(D × lotHT / totalHT)                 │
//! │   ├── egal           floor(D / N), remainder to the last lot            │
//! │   └── personnalise   dureesPersonnalisees[lotId], every lot required    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  clamp          max(raw, 1)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  conservation   Σ = D; surplus taken from the last lot first, walking   │
//! │                 backwards, never below 1 day; shortfall added to the    │
//! │                 last lot                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  windows        [start, start + d₁) [start + d₁, start + d₁ + d₂) ...   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every change made by clamping or conservation is reported as a
//! [`DurationAdjustment`]. The preview is pure: calling it twice with the
//! same input gives the same output and mutates nothing.
//!
//! ## Example
//! ```text
//! Lot A 700 000, Lot B 300 000, 30 days, proportionnel
//!   A: 21 days  [D0, D21)
//!   B:  9 days  [D21, D30)
//! ```

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::hierarchy::Dqe;
use crate::money::{div_round_half_up, percentage_of, Money};
use crate::types::{DqeStatus, DurationMethod};
use crate::validation::{validate_label, validate_total_duration, validate_user_id};
use crate::MINIMUM_STAGE_DAYS;

// =============================================================================
// Eligibility
// =============================================================================

/// Why a DQE cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum NotConvertibleReason {
    NotValidated,
    AlreadyConverted,
    EmptyBudget,
}

impl fmt::Display for NotConvertibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotConvertibleReason::NotValidated => "DQE is not validated",
            NotConvertibleReason::AlreadyConverted => "DQE is already converted",
            NotConvertibleReason::EmptyBudget => "DQE total before tax is zero",
        })
    }
}

/// Answer of [`can_convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConversionEligibility {
    pub can_convert: bool,
    pub reason: Option<NotConvertibleReason>,
}

/// Derived conversion state, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConversionStatus {
    NotConvertible,
    Convertible,
    Converted,
}

impl ConversionStatus {
    pub fn derive(status: DqeStatus, is_converted: bool, total_ht: Money) -> Self {
        if is_converted {
            return ConversionStatus::Converted;
        }
        match eligibility(status, is_converted, total_ht) {
            None => ConversionStatus::Convertible,
            Some(_) => ConversionStatus::NotConvertible,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::NotConvertible => "not_convertible",
            ConversionStatus::Convertible => "convertible",
            ConversionStatus::Converted => "converted",
        }
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a DQE with these fields cannot convert, `None` when it can.
pub fn eligibility(
    status: DqeStatus,
    is_converted: bool,
    total_ht: Money,
) -> Option<NotConvertibleReason> {
    if is_converted {
        Some(NotConvertibleReason::AlreadyConverted)
    } else if status != DqeStatus::Validated {
        Some(NotConvertibleReason::NotValidated)
    } else if !total_ht.is_positive() {
        Some(NotConvertibleReason::EmptyBudget)
    } else {
        None
    }
}

/// Whether `dqe` can be converted now. Never fails.
pub fn can_convert(dqe: &Dqe) -> ConversionEligibility {
    let header = dqe.header();
    let reason = eligibility(header.status, header.is_converted, header.total_ht);
    ConversionEligibility {
        can_convert: reason.is_none(),
        reason,
    }
}

pub fn conversion_status(dqe: &Dqe) -> ConversionStatus {
    let header = dqe.header();
    ConversionStatus::derive(header.status, header.is_converted, header.total_ht)
}

fn ensure_convertible(dqe: &Dqe) -> CoreResult<()> {
    match can_convert(dqe).reason {
        None => Ok(()),
        Some(NotConvertibleReason::AlreadyConverted) => Err(CoreError::AlreadyConverted {
            dqe_id: dqe.id().to_string(),
            project_id: dqe.header().linked_project_id.clone(),
        }),
        Some(reason) => Err(CoreError::NotConvertible {
            dqe_id: dqe.id().to_string(),
            reason,
        }),
    }
}

// =============================================================================
// Request / Preview
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConversionRequest {
    #[serde(rename = "dateDebut")]
    #[ts(as = "String")]
    pub start_date: NaiveDate,
    #[serde(rename = "dureeTotaleJours")]
    pub total_duration_days: i64,
    #[serde(rename = "methodeCalculDurees")]
    pub duration_method: DurationMethod,
    /// Days per lot id, for [`DurationMethod::Custom`].
    #[serde(rename = "dureesPersonnalisees", default)]
    pub custom_durations: Option<BTreeMap<String, i64>>,
    /// Defaults to the DQE name.
    #[serde(rename = "nomProjet", default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Why a stage duration differs from its computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AdjustmentReason {
    /// Raised to the one-day floor.
    Clamped,
    /// Changed so stage durations sum to the total.
    Conservation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DurationAdjustment {
    pub lot_id: String,
    #[serde(rename = "dureeCalculee")]
    pub calculated_days: i64,
    #[serde(rename = "dureeFinale")]
    pub final_days: i64,
    pub reason: AdjustmentReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StagePreview {
    pub lot_id: String,
    /// Position of the stage, from 1.
    pub ordre: u32,
    #[serde(rename = "nom")]
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "dateDebut")]
    #[ts(as = "String")]
    pub start_date: NaiveDate,
    #[serde(rename = "dateFinPrevue")]
    #[ts(as = "String")]
    pub planned_end_date: NaiveDate,
    #[serde(rename = "dureeJours")]
    pub duration_days: i64,
    #[serde(rename = "budgetPrevu")]
    pub planned_budget: Money,
    #[serde(rename = "pourcentageBudget")]
    pub budget_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConversionPreview {
    pub dqe_id: String,
    pub dqe_reference: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(rename = "dateDebut")]
    #[ts(as = "String")]
    pub start_date: NaiveDate,
    #[serde(rename = "dateFinPrevue")]
    #[ts(as = "String")]
    pub planned_end_date: NaiveDate,
    #[serde(rename = "dureeTotaleJours")]
    pub total_duration_days: i64,
    /// DQE total before tax.
    #[serde(rename = "budgetInitial")]
    pub initial_budget: Money,
    #[serde(rename = "methodeCalculDurees")]
    pub duration_method: DurationMethod,
    #[serde(rename = "etapes")]
    pub stages: Vec<StagePreview>,
    #[serde(rename = "ajustements", default)]
    pub adjustments: Vec<DurationAdjustment>,
}

// =============================================================================
// Allocator
// =============================================================================

/// Final durations, in lot order, plus the adjustments applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub days: Vec<i64>,
    pub adjustments: Vec<DurationAdjustment>,
}

/// Splits `total_days` between `lots` (id and budget, in stage order).
///
/// Lot budgets must sum to a positive amount for
/// [`DurationMethod::Proportional`].
pub fn allocate_durations(
    lots: &[(String, Money)],
    total_days: i64,
    method: DurationMethod,
    custom: Option<&BTreeMap<String, i64>>,
) -> Result<Allocation, ValidationError> {
    validate_total_duration(total_days)?;

    let count = lots.len() as i64;
    let minimum = count * MINIMUM_STAGE_DAYS;
    if minimum > total_days {
        return Err(ValidationError::DurationTooShort {
            requested: total_days,
            minimum,
        });
    }

    let raw = match method {
        DurationMethod::Proportional => proportional_days(lots, total_days)?,
        DurationMethod::Equal => equal_days(lots.len(), total_days),
        DurationMethod::Custom => custom_days(lots, custom)?,
    };

    let mut days: Vec<i64> = raw.iter().map(|&d| d.max(MINIMUM_STAGE_DAYS)).collect();
    conserve(&mut days, total_days);

    let adjustments = lots
        .iter()
        .zip(raw.iter().zip(days.iter()))
        .filter(|(_, (calculated, assigned))| calculated != assigned)
        .map(|((lot_id, _), (&calculated, &assigned))| DurationAdjustment {
            lot_id: lot_id.clone(),
            calculated_days: calculated,
            final_days: assigned,
            reason: if calculated < MINIMUM_STAGE_DAYS && assigned == MINIMUM_STAGE_DAYS {
                AdjustmentReason::Clamped
            } else {
                AdjustmentReason::Conservation
            },
        })
        .collect();

    Ok(Allocation { days, adjustments })
}

fn proportional_days(lots: &[(String, Money)], total_days: i64) -> Result<Vec<i64>, ValidationError> {
    let total: Money = lots.iter().map(|(_, budget)| *budget).sum();
    if !total.is_positive() {
        return Err(ValidationError::NonPositiveTotal);
    }
    Ok(lots
        .iter()
        .map(|(_, budget)| {
            div_round_half_up(
                total_days as i128 * budget.units() as i128,
                total.units() as i128,
            ) as i64
        })
        .collect())
}

fn equal_days(count: usize, total_days: i64) -> Vec<i64> {
    if count == 0 {
        return Vec::new();
    }
    let share = total_days / count as i64;
    let mut days = vec![share; count];
    if let Some(last) = days.last_mut() {
        *last = total_days - share * (count as i64 - 1);
    }
    days
}

fn custom_days(
    lots: &[(String, Money)],
    custom: Option<&BTreeMap<String, i64>>,
) -> Result<Vec<i64>, ValidationError> {
    let empty = BTreeMap::new();
    let custom = custom.unwrap_or(&empty);

    let missing: Vec<String> = lots
        .iter()
        .filter(|(lot_id, _)| !custom.contains_key(lot_id))
        .map(|(lot_id, _)| lot_id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::IncompleteCustomDurations { missing });
    }

    if let Some(unknown) = custom
        .keys()
        .find(|key| !lots.iter().any(|(lot_id, _)| lot_id == *key))
    {
        return Err(ValidationError::UnknownCustomDurationLot {
            lot_id: unknown.clone(),
        });
    }

    lots.iter()
        .map(|(lot_id, _)| {
            let days = custom.get(lot_id).copied().unwrap_or_default();
            if days <= 0 {
                return Err(ValidationError::MustBePositive {
                    field: format!("dureesPersonnalisees.{}", lot_id),
                });
            }
            Ok(days)
        })
        .collect()
}

/// Makes `days` sum to `total_days`. Requires `len × minimum <= total_days`
/// and every entry at or above the minimum.
fn conserve(days: &mut [i64], total_days: i64) {
    let sum: i64 = days.iter().sum();
    let diff = total_days - sum;

    if diff > 0 {
        if let Some(last) = days.last_mut() {
            *last += diff;
        }
        return;
    }

    let mut surplus = -diff;
    for day in days.iter_mut().rev() {
        if surplus == 0 {
            break;
        }
        let take = (*day - MINIMUM_STAGE_DAYS).min(surplus);
        *day -= take;
        surplus -= take;
    }
}

fn add_days(date: NaiveDate, days: i64) -> Result<NaiveDate, ValidationError> {
    u64::try_from(days)
        .ok()
        .and_then(|days| date.checked_add_days(Days::new(days)))
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: "dateDebut".to_string(),
            reason: "planned dates fall outside the supported calendar".to_string(),
        })
}

/// Builds the project plan for `dqe`. Pure; fails when the DQE is not
/// convertible or the request is invalid.
pub fn get_conversion_preview(dqe: &Dqe, request: &ConversionRequest) -> CoreResult<ConversionPreview> {
    ensure_convertible(dqe)?;

    let name = match request.project_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => dqe.header().name.clone(),
    };
    validate_label("nomProjet", &name)?;

    let budget_total = dqe.total_ht();
    let lots: Vec<_> = dqe.lots().collect();
    let budgets: Vec<(String, Money)> = lots
        .iter()
        .map(|lot| (lot.id.clone(), lot.total_ht))
        .collect();

    let allocation = allocate_durations(
        &budgets,
        request.total_duration_days,
        request.duration_method,
        request.custom_durations.as_ref(),
    )?;

    let mut stages = Vec::with_capacity(lots.len());
    let mut cursor = request.start_date;
    for (position, (lot, &days)) in lots.iter().zip(allocation.days.iter()).enumerate() {
        let end = add_days(cursor, days)?;
        stages.push(StagePreview {
            lot_id: lot.id.clone(),
            ordre: position as u32 + 1,
            name: lot.name.clone(),
            code: lot.code.clone(),
            description: lot.description.clone(),
            start_date: cursor,
            planned_end_date: end,
            duration_days: days,
            planned_budget: lot.total_ht,
            budget_percentage: percentage_of(lot.total_ht, budget_total),
        });
        cursor = end;
    }

    let planned_end_date = add_days(request.start_date, request.total_duration_days)?;
    debug_assert_eq!(cursor, planned_end_date);

    Ok(ConversionPreview {
        dqe_id: dqe.id().to_string(),
        dqe_reference: dqe.header().reference.clone(),
        name,
        description: request
            .description
            .clone()
            .or_else(|| dqe.header().description.clone()),
        client: dqe.header().client.clone(),
        start_date: request.start_date,
        planned_end_date,
        total_duration_days: request.total_duration_days,
        initial_budget: budget_total,
        duration_method: request.duration_method,
        stages,
        adjustments: allocation.adjustments,
    })
}

impl Dqe {
    /// Records the conversion. Once set, these fields never change again.
    pub fn mark_converted(
        &mut self,
        project_id: &str,
        converted_by: &str,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        ensure_convertible(self)?;
        validate_user_id("convertedById", converted_by)?;
        if project_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "linkedProjectId".to_string(),
            }
            .into());
        }

        self.header.is_converted = true;
        self.header.linked_project_id = Some(project_id.to_string());
        self.header.converted_at = Some(at);
        self.header.converted_by = Some(converted_by.to_string());
        self.header.updated_at = at;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
