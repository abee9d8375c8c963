//! # Domain Types
//!
//! Small value types shared by every module: the VAT rate and the
//! enumerations persisted as text.
//!
//! ## Wire Values
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Rust variant            Wire / database value                          │
//! │  ──────────────────────  ──────────────────────                         │
//! │  DqeStatus::Draft        "brouillon"                                    │
//! │  DqeStatus::InProgress   "en_cours"                                     │
//! │  DqeStatus::Validated    "valide"                                       │
//! │  DqeStatus::Refused      "refuse"                                       │
//! │  DqeStatus::Archived     "archive"                                      │
//! │                                                                         │
//! │  DurationMethod          "proportionnel" | "egal" | "personnalise"      │
//! │  ExpenseType             "main_oeuvre" | "materiaux" | "materiel" |     │
//! │                          "sous_traitance" | "autre"                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

// =============================================================================
// Tax Rate
// =============================================================================

/// VAT rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 1800 bps = 18% (standard VAT rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Creates a tax rate from a percentage (for convenience).
    pub fn from_percentage(pct: f64) -> Self {
        TaxRate((pct * 100.0).round().max(0.0) as u32)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage (for display only).
    #[inline]
    pub fn percentage(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::from_bps(crate::DEFAULT_VAT_RATE_BPS)
    }
}

// =============================================================================
// DQE Status
// =============================================================================

/// Lifecycle status of a DQE.
///
/// ```text
/// Draft ──► InProgress ──► Validated ──► Refused   (terminal)
///   │                         ▲     └──► Archived  (terminal)
///   └─────────validate────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[ts(export)]
pub enum DqeStatus {
    #[serde(rename = "brouillon")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "brouillon"))]
    Draft,
    #[serde(rename = "en_cours")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "en_cours"))]
    InProgress,
    #[serde(rename = "valide")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "valide"))]
    Validated,
    #[serde(rename = "refuse")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "refuse"))]
    Refused,
    #[serde(rename = "archive")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "archive"))]
    Archived,
}

impl DqeStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [DqeStatus; 5] = [
        DqeStatus::Draft,
        DqeStatus::InProgress,
        DqeStatus::Validated,
        DqeStatus::Refused,
        DqeStatus::Archived,
    ];

    /// Wire value of the status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DqeStatus::Draft => "brouillon",
            DqeStatus::InProgress => "en_cours",
            DqeStatus::Validated => "valide",
            DqeStatus::Refused => "refuse",
            DqeStatus::Archived => "archive",
        }
    }

    /// Lots, chapters and items may be added, edited, reordered or deleted.
    pub const fn is_structure_editable(&self) -> bool {
        matches!(self, DqeStatus::Draft | DqeStatus::InProgress)
    }

    /// No transition leaves this status.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, DqeStatus::Refused | DqeStatus::Archived)
    }
}

impl Default for DqeStatus {
    fn default() -> Self {
        DqeStatus::Draft
    }
}

impl fmt::Display for DqeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Duration Method
// =============================================================================

/// How the total project duration is split between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[ts(export)]
pub enum DurationMethod {
    /// Each stage gets a share of days matching its share of the budget.
    #[serde(rename = "proportionnel")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "proportionnel"))]
    Proportional,
    /// Every stage gets the same number of days, remainder to the last one.
    #[serde(rename = "egal")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "egal"))]
    Equal,
    /// Days are given per lot by the caller.
    #[serde(rename = "personnalise")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "personnalise"))]
    Custom,
}

impl DurationMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DurationMethod::Proportional => "proportionnel",
            DurationMethod::Equal => "egal",
            DurationMethod::Custom => "personnalise",
        }
    }
}

impl fmt::Display for DurationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Expense Type
// =============================================================================

/// Category of a déboursé line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[ts(export)]
pub enum ExpenseType {
    #[serde(rename = "main_oeuvre")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "main_oeuvre"))]
    Labor,
    #[serde(rename = "materiaux")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "materiaux"))]
    Materials,
    #[serde(rename = "materiel")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "materiel"))]
    Equipment,
    #[serde(rename = "sous_traitance")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "sous_traitance"))]
    Subcontract,
    #[serde(rename = "autre")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "autre"))]
    Other,
}

impl ExpenseType {
    /// All expense types, in recapitulatif order.
    pub const ALL: [ExpenseType; 5] = [
        ExpenseType::Labor,
        ExpenseType::Materials,
        ExpenseType::Equipment,
        ExpenseType::Subcontract,
        ExpenseType::Other,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ExpenseType::Labor => "main_oeuvre",
            ExpenseType::Materials => "materiaux",
            ExpenseType::Equipment => "materiel",
            ExpenseType::Subcontract => "sous_traitance",
            ExpenseType::Other => "autre",
        }
    }
}

impl fmt::Display for ExpenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_rate_from_percentage() {
        let rate = TaxRate::from_percentage(18.0);
        assert_eq!(rate.bps(), 1_800);
        assert!((rate.percentage() - 18.0).abs() < 0.001);
    }

    #[test]
    fn test_default_tax_rate() {
        assert_eq!(TaxRate::default().bps(), crate::DEFAULT_VAT_RATE_BPS);
    }

    #[test]
    fn test_status_wire_values() {
        for status in DqeStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let back: DqeStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn test_status_editability() {
        assert!(DqeStatus::Draft.is_structure_editable());
        assert!(DqeStatus::InProgress.is_structure_editable());
        assert!(!DqeStatus::Validated.is_structure_editable());
        assert!(!DqeStatus::Refused.is_structure_editable());
        assert!(DqeStatus::Archived.is_terminal());
        assert!(!DqeStatus::Validated.is_terminal());
    }

    #[test]
    fn test_expense_type_wire_values() {
        assert_eq!(serde_json::to_string(&ExpenseType::Labor).unwrap(), "\"main_oeuvre\"");
        assert_eq!(
            serde_json::from_str::<ExpenseType>("\"sous_traitance\"").unwrap(),
            ExpenseType::Subcontract
        );
        assert_eq!(serde_json::to_string(&DurationMethod::Custom).unwrap(), "\"personnalise\"");
    }
}
