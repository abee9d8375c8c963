//! # batiplan-core: Pure Estimation Logic for Batiplan
//!
//! This crate holds the estimation engine of Batiplan: the DQE hierarchy, its
//! rollup, the déboursé sec / margin analysis, the lifecycle rules and the
//! conversion of a validated DQE into a scheduled project. It has zero I/O
//! dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Batiplan Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    UI / API collaborator                        │   │
//! │  │    DQE editor ──► Déboursé editor ──► Conversion wizard         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               batiplan-db (service + repositories)              │   │
//! │  │    load/save DQE, atomic convert, lists and statistics          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ batiplan-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │ hierarchy │  │  rollup   │  │ debourse  │  │ conversion│  │   │
//! │  │   │ Lot/Chap/ │  │  totals   │  │  costs    │  │ allocator │  │   │
//! │  │   │   Item    │  │  TVA/TTC  │  │  margin   │  │  preview  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO CLOCK • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`money`] - Money, Quantity and Coefficient with integer arithmetic
//! - [`types`] - TaxRate and the persisted enumerations
//! - [`error`] - Domain error types
//! - [`validation`] - Field rules
//! - [`hierarchy`] - The DQE arena and its structural mutations
//! - [`rollup`] - Bottom-up totals
//! - [`debourse`] - Cost lines, recapitulatif and margin
//! - [`lifecycle`] - Status transitions and editability
//! - [`conversion`] - Eligibility, duration allocation and project preview
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same input, same output; callers pass the clock in
//! 2. **No I/O**: persistence belongs to batiplan-db
//! 3. **Integer Money**: whole currency units in i64, rounded half-up once
//! 4. **Explicit Errors**: every failure is a typed error, never a panic
//!
//! ## Example Usage
//!
//! ```rust
//! use batiplan_core::money::{Money, Quantity};
//! use batiplan_core::types::TaxRate;
//!
//! let total = Money::from_units(85_000).times_quantity(Quantity::from_units(45)).unwrap();
//! assert_eq!(total.units(), 3_825_000);
//!
//! let tax = total.calculate_tax(TaxRate::from_bps(1_800)).unwrap();
//! assert_eq!(tax.units(), 688_500);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conversion;
pub mod debourse;
pub mod error;
pub mod hierarchy;
pub mod lifecycle;
pub mod money;
pub mod rollup;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conversion::{
    can_convert, conversion_status, get_conversion_preview, ConversionEligibility,
    ConversionPreview, ConversionRequest, ConversionStatus, NotConvertibleReason, StagePreview,
};
pub use debourse::{DebourseLine, ItemCostReport, Recapitulatif};
pub use error::{CoreError, CoreResult, ValidationError};
pub use hierarchy::{Chapter, Dqe, DqeHeader, Item, Lot};
pub use money::{Coefficient, Money, Quantity};
pub use rollup::recompute_totals;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default VAT rate in basis points (18%).
pub const DEFAULT_VAT_RATE_BPS: u32 = 1_800;

/// Maximum length of a reference or node code.
pub const MAX_CODE_LEN: usize = 30;

/// Maximum length of a name or designation.
pub const MAX_LABEL_LEN: usize = 255;

/// Maximum length of a unit of measure.
pub const MAX_UNIT_LEN: usize = 20;

/// Maximum length of the DQE notes.
pub const MAX_NOTES_LEN: usize = 4_000;

/// Largest unit price of an item or déboursé line.
pub const MAX_UNIT_PRICE: i64 = 1_000_000_000_000;

/// Largest quantity, in whole units.
pub const MAX_QUANTITY_UNITS: i64 = 1_000_000;

/// Largest déboursé coefficient, in ten-thousandths (10.0000).
pub const MAX_COEFFICIENT_E4: i64 = 100_000;

/// Largest amount any line, item or total may reach.
pub const MAX_AMOUNT: i64 = 1_000_000_000_000_000;

/// Longest project a conversion will plan (100 years).
pub const MAX_PROJECT_DURATION_DAYS: i64 = 36_500;

/// No stage is ever planned shorter than this.
pub const MINIMUM_STAGE_DAYS: i64 = 1;
