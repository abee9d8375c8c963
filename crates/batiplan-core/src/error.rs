//! # Error Types
//!
//! Domain-specific error types for batiplan-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  batiplan-core errors (this file)                                       │
//! │  ├── CoreError        - Lifecycle / lookup / conversion failures        │
//! │  └── ValidationError  - Invariant and input violations                  │
//! │                                                                         │
//! │  batiplan-db errors (separate crate)                                    │
//! │  └── DbError          - Database failures, wraps CoreError              │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → API collaborator         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Field-level vs Global
//! [`ValidationError::field`] names the offending field when there is one, so
//! callers can attach the message to a form input. Everything else is a
//! global message.

use thiserror::Error;

use crate::conversion::NotConvertibleReason;
use crate::types::DqeStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A DQE, lot, chapter, item or déboursé line does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The operation is not allowed from the current status.
    ///
    /// ## When This Occurs
    /// - Validating a DQE that is already validated
    /// - Refusing a DQE that was never validated
    #[error("DQE {dqe_id} is {status}, cannot {operation}")]
    InvalidState {
        dqe_id: String,
        status: DqeStatus,
        operation: String,
    },

    /// The DQE no longer accepts this kind of change.
    ///
    /// ## When This Occurs
    /// - Editing structure once validated, refused or archived
    /// - Any change once converted
    #[error("DQE {dqe_id} is immutable: {reason}")]
    ImmutableState { dqe_id: String, reason: String },

    /// The DQE has already been turned into a project.
    #[error("DQE {dqe_id} is already converted")]
    AlreadyConverted {
        dqe_id: String,
        project_id: Option<String>,
    },

    /// The DQE cannot be converted yet.
    #[error("DQE {dqe_id} cannot be converted: {reason}")]
    NotConvertible {
        dqe_id: String,
        reason: NotConvertibleReason,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Invariant violations and invalid input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be strictly positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// A computed amount exceeds the largest amount an estimate may carry.
    #[error("{field} exceeds the maximum amount of {max}")]
    AmountTooLarge { field: String, max: i64 },

    /// Invalid format (e.g., invalid UUID, malformed number).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Two siblings share the same `ordre`.
    #[error("ordre {ordre} is already used in {scope}")]
    DuplicateOrdre { scope: String, ordre: u32 },

    /// Two nodes share the same id.
    #[error("duplicate {entity} id: {id}")]
    DuplicateId { entity: String, id: String },

    /// A node points to a parent that does not exist.
    #[error("{entity} {id} references unknown parent {parent_id}")]
    DanglingParent {
        entity: String,
        id: String,
        parent_id: String,
    },

    /// A reorder list is not a permutation of the current siblings.
    #[error("reorder of {scope} must list every sibling exactly once")]
    InvalidReorder { scope: String },

    /// The DQE has no lot at all.
    #[error("DQE has no lot")]
    EmptyEstimate,

    /// A lot has no chapter.
    #[error("lot {code} has no chapter")]
    EmptyLot { lot_id: String, code: String },

    /// A chapter has no item.
    #[error("chapter {code} has no item")]
    EmptyChapter { chapter_id: String, code: String },

    /// An item quantity is zero or negative.
    #[error("item {code} must have a positive quantity")]
    NonPositiveQuantity { item_id: String, code: String },

    /// An item unit price is negative.
    #[error("item {code} must not have a negative unit price")]
    NegativePrice { item_id: String, code: String },

    /// The DQE total before tax is zero.
    #[error("DQE total before tax must be positive")]
    NonPositiveTotal,

    /// Custom durations are missing for some lots.
    #[error("custom durations missing for lots: {}", missing.join(", "))]
    IncompleteCustomDurations { missing: Vec<String> },

    /// A custom duration is given for a lot that is not in the DQE.
    #[error("custom duration given for unknown lot {lot_id}")]
    UnknownCustomDurationLot { lot_id: String },

    /// The requested duration cannot give every stage at least one day.
    #[error("total duration of {requested} days is shorter than the {minimum}-day minimum")]
    DurationTooShort { requested: i64, minimum: i64 },
}

impl ValidationError {
    /// Name of the offending input field, for field-level messages.
    ///
    /// Returns `None` for structural errors that concern the DQE as a whole.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::Required { field }
            | ValidationError::TooLong { field, .. }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::MustBePositive { field }
            | ValidationError::MustNotBeNegative { field }
            | ValidationError::AmountTooLarge { field, .. }
            | ValidationError::InvalidFormat { field, .. } => Some(field),
            ValidationError::DuplicateOrdre { .. } | ValidationError::InvalidReorder { .. } => {
                Some("ordre")
            }
            ValidationError::NonPositiveQuantity { .. } => Some("quantite"),
            ValidationError::NegativePrice { .. } => Some("prixUnitaireHT"),
            ValidationError::IncompleteCustomDurations { .. }
            | ValidationError::UnknownCustomDurationLot { .. } => Some("dureesPersonnalisees"),
            ValidationError::DurationTooShort { .. } => Some("dureeTotaleJours"),
            ValidationError::DuplicateId { .. }
            | ValidationError::DanglingParent { .. }
            | ValidationError::EmptyEstimate
            | ValidationError::EmptyLot { .. }
            | ValidationError::EmptyChapter { .. }
            | ValidationError::NonPositiveTotal => None,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
