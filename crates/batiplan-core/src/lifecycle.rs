//! # Lifecycle Module
//!
//! Status transitions of a DQE and the editability rules they imply.
//!
//! ## State Machine
//! ```text
//!                 start_progress
//!   ┌───────────┐ ───────────► ┌───────────┐
//!   │ brouillon │              │ en_cours  │
//!   └─────┬─────┘              └─────┬─────┘
//!         │ validate                 │ validate
//!         └──────────► ┌────────┐ ◄──┘
//!                      │ valide │
//!                      └───┬────┘
//!              refuse ┌────┴────┐ archive
//!                     ▼         ▼
//!               ┌────────┐ ┌─────────┐
//!               │ refuse │ │ archive │   (terminal)
//!               └────────┘ └─────────┘
//! ```
//!
//! ## What Can Change When
//! ```text
//! ┌────────────────────┬───────────┬──────────┬────────┬─────────┬───────────┐
//! │                    │ brouillon │ en_cours │ valide │ refuse/ │ converted │
//! │                    │           │          │        │ archive │           │
//! ├────────────────────┼───────────┼──────────┼────────┼─────────┼───────────┤
//! │ structure, tauxTVA │    yes    │   yes    │   no   │   no    │    no     │
//! │ déboursé lines     │    yes    │   yes    │  yes   │   no    │    no     │
//! │ notes              │    yes    │   yes    │  yes   │   yes   │    no     │
//! └────────────────────┴───────────┴──────────┴────────┴─────────┴───────────┘
//! ```

use chrono::{DateTime, Utc};

use crate::debourse::DebourseLine;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::hierarchy::Dqe;
use crate::money::{Money, Quantity};
use crate::rollup::{self, recompute_totals};
use crate::types::{DqeStatus, TaxRate};
use crate::validation::{validate_user_id, validate_vat_rate_bps};
use crate::MAX_NOTES_LEN;

/// Whether `from → to` is an edge of the state machine.
pub fn can_transition(from: DqeStatus, to: DqeStatus) -> bool {
    use DqeStatus::*;
    matches!(
        (from, to),
        (Draft, InProgress)
            | (Draft, Validated)
            | (InProgress, Validated)
            | (Validated, Refused)
            | (Validated, Archived)
    )
}

fn converted_error(dqe: &Dqe) -> CoreError {
    CoreError::ImmutableState {
        dqe_id: dqe.id().to_string(),
        reason: "converted to a project".to_string(),
    }
}

/// Lots, chapters, items and the VAT rate may change.
pub fn ensure_structure_editable(dqe: &Dqe) -> CoreResult<()> {
    if dqe.is_converted() {
        return Err(converted_error(dqe));
    }
    if !dqe.status().is_structure_editable() {
        return Err(CoreError::ImmutableState {
            dqe_id: dqe.id().to_string(),
            reason: format!("structure is frozen while {}", dqe.status()),
        });
    }
    Ok(())
}

/// Déboursé lines may change.
pub fn ensure_costs_editable(dqe: &Dqe) -> CoreResult<()> {
    if dqe.is_converted() {
        return Err(converted_error(dqe));
    }
    if dqe.status().is_terminal() {
        return Err(CoreError::ImmutableState {
            dqe_id: dqe.id().to_string(),
            reason: format!("costs are frozen while {}", dqe.status()),
        });
    }
    Ok(())
}

/// Notes may change.
pub fn ensure_annotations_editable(dqe: &Dqe) -> CoreResult<()> {
    if dqe.is_converted() {
        return Err(converted_error(dqe));
    }
    Ok(())
}

/// Checks that `next` may be stored over `stored`, the last saved state of
/// the same DQE.
///
/// An aggregate can be rebuilt from any document, so the rules of the
/// stored status apply, whatever `next` claims about itself:
/// - nothing replaces a converted DQE, and only the conversion transaction
///   records a conversion
/// - a status change must be an edge of the state machine, and reaching
///   `valide` needs a tree that passes validation
/// - a frozen structure must come back unchanged, as must the déboursé
///   lines of a refused or archived DQE
pub fn ensure_save_allowed(stored: &Dqe, next: &Dqe) -> CoreResult<()> {
    if stored.is_converted() {
        return Err(converted_error(stored));
    }
    if next.is_converted() {
        return Err(CoreError::ImmutableState {
            dqe_id: next.id().to_string(),
            reason: "a conversion is only recorded by the conversion transaction".to_string(),
        });
    }

    let (from, to) = (stored.status(), next.status());
    if from != to {
        if !can_transition(from, to) {
            return Err(CoreError::InvalidState {
                dqe_id: stored.id().to_string(),
                status: from,
                operation: format!("change status to {}", to),
            });
        }
        if to == DqeStatus::Validated {
            if next.header().validated_by.is_none() || next.header().validated_at.is_none() {
                return Err(ValidationError::Required {
                    field: "validePar".to_string(),
                }
                .into());
            }
            checked_for_validation(next)?;
        }
    }

    if !from.is_structure_editable() && FrozenShape::of(stored) != FrozenShape::of(next) {
        return Err(CoreError::ImmutableState {
            dqe_id: stored.id().to_string(),
            reason: format!("structure is frozen while {}", from),
        });
    }
    if to.is_terminal() && cost_lines(stored) != cost_lines(next) {
        return Err(CoreError::ImmutableState {
            dqe_id: stored.id().to_string(),
            reason: format!("costs are frozen while {}", to),
        });
    }
    Ok(())
}

/// Checks a document stored for the first time as if it were saved over a
/// fresh draft of itself.
pub fn ensure_insert_allowed(next: &Dqe) -> CoreResult<()> {
    let mut draft = next.clone();
    draft.header.status = DqeStatus::Draft;
    draft.header.is_converted = false;
    ensure_save_allowed(&draft, next)
}

/// Recomputed copy of `dqe`, if it can be validated.
fn checked_for_validation(dqe: &Dqe) -> CoreResult<Dqe> {
    if dqe.lot_count() == 0 {
        return Err(ValidationError::EmptyEstimate.into());
    }
    let next = recompute_totals(dqe)?;
    if !next.total_ht().is_positive() {
        return Err(ValidationError::NonPositiveTotal.into());
    }
    Ok(next)
}

type LotShape<'a> = (&'a str, &'a str, &'a str, Option<&'a str>, u32);
type ChapterShape<'a> = (&'a str, &'a str, &'a str, &'a str, u32);
type ItemShape<'a> = (&'a str, &'a str, &'a str, &'a str, &'a str, Quantity, Money, u32);

/// The fields a validated DQE pins, nodes in tree order.
#[derive(Debug, PartialEq)]
struct FrozenShape<'a> {
    reference: &'a str,
    name: &'a str,
    client: Option<&'a str>,
    description: Option<&'a str>,
    vat_rate: TaxRate,
    validated_at: Option<DateTime<Utc>>,
    validated_by: Option<&'a str>,
    lots: Vec<LotShape<'a>>,
    chapters: Vec<ChapterShape<'a>>,
    items: Vec<ItemShape<'a>>,
}

impl<'a> FrozenShape<'a> {
    fn of(dqe: &'a Dqe) -> Self {
        let header = dqe.header();
        FrozenShape {
            reference: &header.reference,
            name: &header.name,
            client: header.client.as_deref(),
            description: header.description.as_deref(),
            vat_rate: header.vat_rate,
            validated_at: header.validated_at,
            validated_by: header.validated_by.as_deref(),
            lots: dqe
                .lots()
                .map(|l| (l.id.as_str(), l.code.as_str(), l.name.as_str(), l.description.as_deref(), l.ordre))
                .collect(),
            chapters: dqe
                .lots()
                .flat_map(|l| dqe.chapters_of(&l.id))
                .map(|c| (c.id.as_str(), c.lot_id.as_str(), c.code.as_str(), c.name.as_str(), c.ordre))
                .collect(),
            items: dqe
                .items()
                .map(|i| {
                    (
                        i.id.as_str(),
                        i.chapter_id.as_str(),
                        i.code.as_str(),
                        i.designation.as_str(),
                        i.unit.as_str(),
                        i.quantity,
                        i.unit_price_ht,
                        i.ordre,
                    )
                })
                .collect(),
        }
    }
}

fn cost_lines(dqe: &Dqe) -> Vec<(&str, &[DebourseLine])> {
    dqe.items()
        .map(|i| (i.id.as_str(), i.debourse_lines.as_slice()))
        .collect()
}

impl Dqe {
    /// Validates the DQE: totals are recomputed and checked, then the status
    /// becomes `valide`.
    ///
    /// On any failure the DQE is left exactly as it was.
    pub fn validate(&mut self, validator_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        let status = self.status();
        if self.is_converted()
            || !matches!(status, DqeStatus::Draft | DqeStatus::InProgress)
        {
            return Err(CoreError::InvalidState {
                dqe_id: self.id().to_string(),
                status,
                operation: "validate".to_string(),
            });
        }
        validate_user_id("validePar", validator_id)?;

        let mut next = checked_for_validation(self)?;

        next.header.status = DqeStatus::Validated;
        next.header.validated_at = Some(now);
        next.header.validated_by = Some(validator_id.to_string());
        next.header.updated_at = now;
        *self = next;
        Ok(())
    }

    /// `brouillon → en_cours`.
    pub fn start_progress(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(DqeStatus::InProgress, "start progress", now)
    }

    /// `valide → refuse`.
    pub fn refuse(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(DqeStatus::Refused, "refuse", now)
    }

    /// `valide → archive`.
    pub fn archive(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(DqeStatus::Archived, "archive", now)
    }

    fn transition(&mut self, to: DqeStatus, operation: &str, now: DateTime<Utc>) -> CoreResult<()> {
        if self.is_converted() {
            return Err(converted_error(self));
        }
        let from = self.status();
        if !can_transition(from, to) {
            return Err(CoreError::InvalidState {
                dqe_id: self.id().to_string(),
                status: from,
                operation: operation.to_string(),
            });
        }
        self.header.status = to;
        self.header.updated_at = now;
        Ok(())
    }

    /// Replaces the notes; blank notes clear them.
    pub fn set_notes(&mut self, notes: Option<String>) -> CoreResult<()> {
        ensure_annotations_editable(self)?;
        let notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if let Some(n) = &notes {
            if n.chars().count() > MAX_NOTES_LEN {
                return Err(ValidationError::TooLong {
                    field: "notes".to_string(),
                    max: MAX_NOTES_LEN,
                }
                .into());
            }
        }
        self.header.notes = notes;
        Ok(())
    }

    /// Changes the VAT rate and re-derives the tax amounts.
    pub fn set_vat_rate(&mut self, rate: TaxRate) -> CoreResult<()> {
        ensure_structure_editable(self)?;
        validate_vat_rate_bps(rate.bps())?;
        let previous = std::mem::replace(&mut self.header.vat_rate, rate);
        if let Err(err) = rollup::refresh_totals(self) {
            self.header.vat_rate = previous;
            return Err(err.into());
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tests::{chapter, dqe_with_lot_revenues, item, lot, new_dqe, now};

    #[test]
    fn test_transition_table() {
        use DqeStatus::*;
        assert!(can_transition(Draft, InProgress));
        assert!(can_transition(Draft, Validated));
        assert!(can_transition(InProgress, Validated));
        assert!(can_transition(Validated, Refused));
        assert!(can_transition(Validated, Archived));

        assert!(!can_transition(InProgress, Draft));
        assert!(!can_transition(Validated, Draft));
        assert!(!can_transition(Draft, Refused));
        assert!(!can_transition(Refused, Archived));
        assert!(!can_transition(Archived, Validated));
    }

    #[test]
    fn test_validate_sets_metadata() {
        let mut dqe = dqe_with_lot_revenues(&[700_000, 300_000]);
        dqe.validate("validator-1", now()).unwrap();

        let header = dqe.header();
        assert_eq!(header.status, DqeStatus::Validated);
        assert_eq!(header.validated_by.as_deref(), Some("validator-1"));
        assert_eq!(header.validated_at, Some(now()));
        assert_eq!(header.total_ht.units(), 1_000_000);
    }

    #[test]
    fn test_validate_from_in_progress() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.start_progress(now()).unwrap();
        assert_eq!(dqe.status(), DqeStatus::InProgress);
        dqe.validate("validator-1", now()).unwrap();
        assert_eq!(dqe.status(), DqeStatus::Validated);
    }

    #[test]
    fn test_validate_empty_lot_leaves_dqe_untouched() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.add_lot(lot("EMPTY")).unwrap();
        let before = dqe.clone();

        let result = dqe.validate("validator-1", now());
        assert!(matches!(
            result,
            Err(CoreError::Validation(ValidationError::EmptyLot { .. }))
        ));
        assert_eq!(dqe, before);
        assert_eq!(dqe.status(), DqeStatus::Draft);
        assert!(dqe.header().validated_at.is_none());
    }

    #[test]
    fn test_validate_empty_estimate() {
        let mut dqe = new_dqe();
        assert!(matches!(
            dqe.validate("validator-1", now()),
            Err(CoreError::Validation(ValidationError::EmptyEstimate))
        ));
    }

    #[test]
    fn test_validate_zero_total() {
        let mut dqe = dqe_with_lot_revenues(&[0]);
        assert!(matches!(
            dqe.validate("validator-1", now()),
            Err(CoreError::Validation(ValidationError::NonPositiveTotal))
        ));
        assert_eq!(dqe.status(), DqeStatus::Draft);
    }

    #[test]
    fn test_validate_twice_is_invalid_state() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.validate("validator-1", now()).unwrap();
        assert!(matches!(
            dqe.validate("validator-1", now()),
            Err(CoreError::InvalidState {
                status: DqeStatus::Validated,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_requires_validator() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        assert!(dqe.validate(" ", now()).is_err());
        assert_eq!(dqe.status(), DqeStatus::Draft);
    }

    #[test]
    fn test_structure_frozen_after_validation() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.validate("validator-1", now()).unwrap();
        let lot_id = dqe.lots().next().unwrap().id.clone();

        assert!(matches!(dqe.add_lot(lot("NEW")), Err(CoreError::ImmutableState { .. })));
        assert!(matches!(
            dqe.add_chapter(&lot_id, chapter("NEW")),
            Err(CoreError::ImmutableState { .. })
        ));
        let chapter_id = dqe.chapters_of(&lot_id).next().unwrap().id.clone();
        assert!(dqe.add_item(&chapter_id, item("NEW", 1, 1)).is_err());
        assert!(dqe.remove_lot(&lot_id).is_err());
        assert!(dqe.set_vat_rate(TaxRate::from_bps(1_000)).is_err());
    }

    fn cost_line() -> crate::debourse::NewDebourseLine {
        crate::debourse::NewDebourseLine {
            expense_type: crate::types::ExpenseType::Labor,
            designation: "Manoeuvres".to_string(),
            unit: "h".to_string(),
            quantity: crate::money::Quantity::from_units(8),
            unit_price_ht: crate::money::Money::from_units(1_250),
            coefficient: None,
        }
    }

    #[test]
    fn test_save_allowed_for_regular_edits() {
        let draft = dqe_with_lot_revenues(&[1_000]);

        let mut validated = draft.clone();
        validated.validate("validator-1", now()).unwrap();
        assert!(ensure_save_allowed(&draft, &validated).is_ok());

        let mut costed = validated.clone();
        let item_id = costed.items().next().unwrap().id.clone();
        costed.create_debourse_line(&item_id, cost_line()).unwrap();
        costed.set_notes(Some("relance client".to_string())).unwrap();
        assert!(ensure_save_allowed(&validated, &costed).is_ok());

        let mut archived = costed.clone();
        archived.archive(now()).unwrap();
        assert!(ensure_save_allowed(&costed, &archived).is_ok());
    }

    #[test]
    fn test_save_rejects_undoing_a_conversion() {
        let mut stored = dqe_with_lot_revenues(&[1_000]);
        stored.validate("validator-1", now()).unwrap();
        stored.mark_converted("project-1", "user-1", now()).unwrap();

        let mut forged = stored.clone();
        forged.header.is_converted = false;
        forged.header.linked_project_id = None;
        forged.header.status = DqeStatus::Draft;

        assert!(matches!(
            ensure_save_allowed(&stored, &forged),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_save_rejects_recording_a_conversion() {
        let mut stored = dqe_with_lot_revenues(&[1_000]);
        stored.validate("validator-1", now()).unwrap();
        let mut converted = stored.clone();
        converted.mark_converted("project-1", "user-1", now()).unwrap();

        assert!(matches!(
            ensure_save_allowed(&stored, &converted),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_save_rejects_status_outside_the_state_machine() {
        let mut stored = dqe_with_lot_revenues(&[1_000]);
        stored.validate("validator-1", now()).unwrap();

        let mut reopened = stored.clone();
        reopened.header.status = DqeStatus::Draft;

        assert!(matches!(
            ensure_save_allowed(&stored, &reopened),
            Err(CoreError::InvalidState { status: DqeStatus::Validated, .. })
        ));
    }

    #[test]
    fn test_save_rejects_validated_status_on_an_empty_tree() {
        let stored = new_dqe();

        let mut forged = stored.clone();
        forged.header.status = DqeStatus::Validated;
        assert!(matches!(
            ensure_save_allowed(&stored, &forged),
            Err(CoreError::Validation(ValidationError::Required { .. }))
        ));

        forged.header.validated_by = Some("validator-1".to_string());
        forged.header.validated_at = Some(now());
        assert!(matches!(
            ensure_save_allowed(&stored, &forged),
            Err(CoreError::Validation(ValidationError::EmptyEstimate))
        ));
    }

    #[test]
    fn test_insert_judges_the_document_against_a_draft() {
        let mut validated = dqe_with_lot_revenues(&[1_000]);
        validated.validate("validator-1", now()).unwrap();
        assert!(ensure_insert_allowed(&validated).is_ok());

        let mut converted = validated.clone();
        converted.mark_converted("project-1", "user-1", now()).unwrap();
        assert!(matches!(
            ensure_insert_allowed(&converted),
            Err(CoreError::ImmutableState { .. })
        ));

        let mut forged = new_dqe();
        forged.header.status = DqeStatus::Validated;
        forged.header.validated_by = Some("validator-1".to_string());
        forged.header.validated_at = Some(now());
        assert!(matches!(
            ensure_insert_allowed(&forged),
            Err(CoreError::Validation(ValidationError::EmptyEstimate))
        ));
    }

    #[test]
    fn test_save_rejects_changes_to_a_frozen_structure() {
        let mut stored = dqe_with_lot_revenues(&[1_000]);
        stored.validate("validator-1", now()).unwrap();

        let mut forged = stored.clone();
        forged.header.status = DqeStatus::Draft;
        forged.add_lot(lot("NEW")).unwrap();
        forged.header.status = DqeStatus::Validated;

        assert!(matches!(
            ensure_save_allowed(&stored, &forged),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_save_rejects_cost_changes_when_archiving() {
        let mut stored = dqe_with_lot_revenues(&[1_000]);
        stored.validate("validator-1", now()).unwrap();

        let mut next = stored.clone();
        let item_id = next.items().next().unwrap().id.clone();
        next.create_debourse_line(&item_id, cost_line()).unwrap();
        next.archive(now()).unwrap();

        assert!(matches!(
            ensure_save_allowed(&stored, &next),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_refuse_and_archive() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        assert!(matches!(dqe.refuse(now()), Err(CoreError::InvalidState { .. })));

        dqe.validate("validator-1", now()).unwrap();
        dqe.archive(now()).unwrap();
        assert_eq!(dqe.status(), DqeStatus::Archived);
        assert!(dqe.refuse(now()).is_err());
    }

    #[test]
    fn test_notes_editable_until_converted() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.validate("validator-1", now()).unwrap();
        dqe.set_notes(Some("  relancer le client ".to_string())).unwrap();
        assert_eq!(dqe.header().notes.as_deref(), Some("relancer le client"));

        dqe.set_notes(Some("   ".to_string())).unwrap();
        assert!(dqe.header().notes.is_none());

        dqe.mark_converted("project-1", "user-1", now()).unwrap();
        assert!(matches!(
            dqe.set_notes(Some("late".to_string())),
            Err(CoreError::ImmutableState { .. })
        ));
    }

    #[test]
    fn test_set_vat_rate_rederives_tax() {
        let mut dqe = dqe_with_lot_revenues(&[1_000_000]);
        dqe.set_vat_rate(TaxRate::from_bps(1_000)).unwrap();
        assert_eq!(dqe.header().vat_amount.units(), 100_000);
        assert_eq!(dqe.header().total_ttc.units(), 1_100_000);
        assert!(dqe.set_vat_rate(TaxRate::from_bps(10_001)).is_err());
    }

    #[test]
    fn test_converted_rejects_every_transition() {
        let mut dqe = dqe_with_lot_revenues(&[1_000]);
        dqe.validate("validator-1", now()).unwrap();
        dqe.mark_converted("project-1", "user-1", now()).unwrap();

        assert!(matches!(dqe.archive(now()), Err(CoreError::ImmutableState { .. })));
        assert!(matches!(dqe.refuse(now()), Err(CoreError::ImmutableState { .. })));
        assert!(matches!(
            dqe.validate("validator-1", now()),
            Err(CoreError::InvalidState { .. })
        ));
    }
}
