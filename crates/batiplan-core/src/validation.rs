//! # Validation Module
//!
//! Input validation for estimate fields, applied before any value enters the
//! hierarchy.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: UI forms                                                      │
//! │  └── Immediate user feedback                                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE (field rules)                                     │
//! │  ├── codes, labels, units                                               │
//! │  └── quantity > 0, price >= 0, coefficient > 0                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: rollup / lifecycle (structural rules)                         │
//! │  └── non-empty lots and chapters, positive total                        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 4: SQLite constraints                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::money::{Coefficient, Money, Quantity};
use crate::{
    MAX_CODE_LEN, MAX_COEFFICIENT_E4, MAX_LABEL_LEN, MAX_PROJECT_DURATION_DAYS, MAX_QUANTITY_UNITS,
    MAX_UNIT_LEN, MAX_UNIT_PRICE,
};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a business code (DQE reference, lot/chapter/item code).
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_CODE_LEN`] characters
/// - Letters, digits and `- _ . /` only
///
/// ## Example
/// ```rust
/// use batiplan_core::validation::validate_code;
///
/// assert!(validate_code("code", "LOT-01").is_ok());
/// assert!(validate_code("code", "2.1.3").is_ok());
/// assert!(validate_code("code", "").is_err());
/// assert!(validate_code("code", "has space").is_err());
/// ```
pub fn validate_code(field: &str, code: &str) -> ValidationResult<()> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if code.chars().count() > MAX_CODE_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_CODE_LEN,
        });
    }

    if !code
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers, '-', '_', '.' and '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates a free label (name, designation).
///
/// ## Example
/// ```rust
/// use batiplan_core::validation::validate_label;
///
/// assert!(validate_label("designation", "Béton armé pour semelles").is_ok());
/// assert!(validate_label("designation", "   ").is_err());
/// ```
pub fn validate_label(field: &str, label: &str) -> ValidationResult<()> {
    let label = label.trim();

    if label.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if label.chars().count() > MAX_LABEL_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_LABEL_LEN,
        });
    }

    Ok(())
}

/// Validates a unit of measure (`m²`, `m³`, `kg`, `ens`, ...).
pub fn validate_unit(unit: &str) -> ValidationResult<()> {
    let unit = unit.trim();

    if unit.is_empty() {
        return Err(ValidationError::Required {
            field: "unite".to_string(),
        });
    }

    if unit.chars().count() > MAX_UNIT_LEN {
        return Err(ValidationError::TooLong {
            field: "unite".to_string(),
            max: MAX_UNIT_LEN,
        });
    }

    Ok(())
}

/// Validates the id of the user performing an operation.
pub fn validate_user_id(field: &str, user_id: &str) -> ValidationResult<()> {
    if user_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity.
///
/// ## Rules
/// - Must be strictly positive
/// - At most [`MAX_QUANTITY_UNITS`] whole units
pub fn validate_quantity(quantity: Quantity) -> ValidationResult<()> {
    if !quantity.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "quantite".to_string(),
        });
    }
    if quantity.milli() > MAX_QUANTITY_UNITS * Quantity::SCALE {
        return Err(ValidationError::OutOfRange {
            field: "quantite".to_string(),
            min: 0,
            max: MAX_QUANTITY_UNITS,
        });
    }
    Ok(())
}

/// Validates a unit price: zero is allowed, negative is not.
///
/// ## Example
/// ```rust
/// use batiplan_core::money::Money;
/// use batiplan_core::validation::validate_unit_price;
///
/// assert!(validate_unit_price(Money::from_units(85_000)).is_ok());
/// assert!(validate_unit_price(Money::zero()).is_ok());
/// assert!(validate_unit_price(Money::from_units(-1)).is_err());
/// assert!(validate_unit_price(Money::from_units(i64::MAX / 5)).is_err());
/// ```
pub fn validate_unit_price(price: Money) -> ValidationResult<()> {
    if price.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: "prixUnitaireHT".to_string(),
        });
    }
    if price.units() > MAX_UNIT_PRICE {
        return Err(ValidationError::OutOfRange {
            field: "prixUnitaireHT".to_string(),
            min: 0,
            max: MAX_UNIT_PRICE,
        });
    }
    Ok(())
}

/// Validates a déboursé coefficient: strictly positive, at most 10.
pub fn validate_coefficient(coefficient: Coefficient) -> ValidationResult<()> {
    if !coefficient.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "coefficient".to_string(),
        });
    }
    if coefficient.ten_thousandths() > MAX_COEFFICIENT_E4 {
        return Err(ValidationError::OutOfRange {
            field: "coefficient".to_string(),
            min: 0,
            max: MAX_COEFFICIENT_E4,
        });
    }
    Ok(())
}

/// Validates a VAT rate in basis points.
///
/// ## Rules
/// - Must be between 0 and 10000 (0% to 100%)
pub fn validate_vat_rate_bps(bps: u32) -> ValidationResult<()> {
    if bps > 10_000 {
        return Err(ValidationError::OutOfRange {
            field: "tauxTVA".to_string(),
            min: 0,
            max: 10_000,
        });
    }
    Ok(())
}

/// Validates a total project duration in days.
pub fn validate_total_duration(days: i64) -> ValidationResult<()> {
    if days <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "dureeTotaleJours".to_string(),
        });
    }
    if days > MAX_PROJECT_DURATION_DAYS {
        return Err(ValidationError::OutOfRange {
            field: "dureeTotaleJours".to_string(),
            min: 1,
            max: MAX_PROJECT_DURATION_DAYS,
        });
    }
    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a UUID string format.
///
/// ## Example
/// ```rust
/// use batiplan_core::validation::validate_uuid;
///
/// assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("not-a-uuid").is_err());
/// ```
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_code() {
        assert!(validate_code("code", "LOT-01").is_ok());
        assert!(validate_code("code", "1.2").is_ok());
        assert!(validate_code("code", "GO/02").is_ok());

        assert!(validate_code("code", "").is_err());
        assert!(validate_code("code", "   ").is_err());
        assert!(validate_code("code", "A B").is_err());
        assert!(validate_code("code", &"A".repeat(MAX_CODE_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("nom", "Gros oeuvre").is_ok());
        assert!(validate_label("nom", "").is_err());
        assert!(validate_label("nom", &"é".repeat(MAX_LABEL_LEN + 1)).is_err());
        assert!(validate_label("nom", &"é".repeat(MAX_LABEL_LEN)).is_ok());
    }

    #[test]
    fn test_validate_unit() {
        assert!(validate_unit("m²").is_ok());
        assert!(validate_unit("").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(Quantity::from_milli(1)).is_ok());
        assert!(validate_quantity(Quantity::zero()).is_err());
        assert!(validate_quantity(Quantity::from_milli(-5)).is_err());
        assert!(validate_quantity(Quantity::from_units(MAX_QUANTITY_UNITS)).is_ok());
        assert!(matches!(
            validate_quantity(Quantity::from_milli(MAX_QUANTITY_UNITS * Quantity::SCALE + 1)),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_coefficient() {
        assert!(validate_coefficient(Coefficient::ONE).is_ok());
        assert!(validate_coefficient(Coefficient::from_ten_thousandths(0)).is_err());
        assert!(validate_coefficient(Coefficient::from_ten_thousandths(MAX_COEFFICIENT_E4)).is_ok());
        assert!(validate_coefficient(Coefficient::from_ten_thousandths(MAX_COEFFICIENT_E4 + 1)).is_err());
    }

    #[test]
    fn test_validate_vat_rate_bps() {
        assert!(validate_vat_rate_bps(0).is_ok());
        assert!(validate_vat_rate_bps(1_800).is_ok());
        assert!(validate_vat_rate_bps(10_000).is_ok());
        assert!(validate_vat_rate_bps(10_001).is_err());
    }

    #[test]
    fn test_validate_total_duration() {
        assert!(validate_total_duration(30).is_ok());
        assert!(validate_total_duration(0).is_err());
        assert!(validate_total_duration(-3).is_err());
        assert!(validate_total_duration(MAX_PROJECT_DURATION_DAYS + 1).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("123").is_err());
    }
}
