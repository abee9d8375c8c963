//! # Money Module
//!
//! Fixed-precision types for every amount and quantity in an estimate.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  In floating point:                                                     │
//! │    45 × 85000.1 = 3825004.4999999995  ❌ rounds the wrong way           │
//! │                                                                         │
//! │  OUR SOLUTION: integers with a known scale                              │
//! │    Money       whole currency units (no sub-unit, e.g. XOF)             │
//! │    Quantity    thousandths  (45.5 m² = 45_500)                          │
//! │    Coefficient ten-thousandths (1.2 = 12_000)                           │
//! │                                                                         │
//! │  Products are computed exactly in i128, then rounded ONCE,              │
//! │  half-up, to the whole currency unit.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use batiplan_core::money::{Money, Quantity};
//!
//! let price = Money::from_units(85_000);
//! let total = price.times_quantity(Quantity::from_units(45));
//! assert_eq!(total.map(|m| m.units()), Some(3_825_000));
//! ```

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::types::TaxRate;

// =============================================================================
// Rounding
// =============================================================================

/// Divides `numerator` by a positive `denominator`, rounding half away from zero.
///
/// For the non-negative values found in an estimate this is plain
/// round-half-up: `2.5 → 3`, `2.4 → 2`.
pub(crate) fn div_round_half_up(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0, "denominator must be positive");
    if numerator >= 0 {
        (numerator * 2 + denominator) / (denominator * 2)
    } else {
        -((-numerator * 2 + denominator) / (denominator * 2))
    }
}

/// Narrows an `i128` intermediate back into `Money`, `None` if it does not fit.
fn narrow(value: i128) -> Option<Money> {
    i64::try_from(value).ok().map(Money)
}

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in whole currency units.
///
/// ## Design Decisions
/// - **i64 (signed)**: margins can be negative
/// - **No sub-unit**: the currency has no cents, every total is rounded to
///   the unit
/// - **Serialized as a plain integer**: `3825000`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from whole currency units.
    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Money(units)
    }

    /// Returns the value in whole currency units.
    #[inline]
    pub const fn units(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Multiplies a unit price by a quantity, rounding half-up to the unit.
    ///
    /// `None` when the result does not fit in an `i64`.
    ///
    /// ## Example
    /// ```rust
    /// use batiplan_core::money::{Money, Quantity};
    ///
    /// let price = Money::from_units(1_250);
    /// // 2.5 × 1250 = 3125
    /// assert_eq!(price.times_quantity(Quantity::from_milli(2_500)), Some(Money::from_units(3_125)));
    /// // 0.333 × 1000 = 333
    /// assert_eq!(
    ///     Money::from_units(1_000).times_quantity(Quantity::from_milli(333)),
    ///     Some(Money::from_units(333))
    /// );
    /// ```
    pub fn times_quantity(&self, quantity: Quantity) -> Option<Money> {
        let exact = self.0 as i128 * quantity.milli() as i128;
        narrow(div_round_half_up(exact, Quantity::SCALE as i128))
    }

    /// Multiplies a unit price by a quantity and a coefficient.
    ///
    /// The full product is computed exactly and rounded once.
    ///
    /// ## Example
    /// ```rust
    /// use batiplan_core::money::{Coefficient, Money, Quantity};
    ///
    /// let amount = Money::from_units(2_500)
    ///     .times_quantity_coefficient(Quantity::from_units(10), Coefficient::from_ten_thousandths(12_000));
    /// assert_eq!(amount, Some(Money::from_units(30_000)));
    /// ```
    pub fn times_quantity_coefficient(
        &self,
        quantity: Quantity,
        coefficient: Coefficient,
    ) -> Option<Money> {
        let exact = self.0 as i128 * quantity.milli() as i128 * coefficient.ten_thousandths() as i128;
        let scale = Quantity::SCALE as i128 * Coefficient::SCALE as i128;
        narrow(div_round_half_up(exact, scale))
    }

    /// Calculates VAT on a pre-tax amount, rounding half-up to the unit.
    ///
    /// ## Example
    /// ```rust
    /// use batiplan_core::money::Money;
    /// use batiplan_core::types::TaxRate;
    ///
    /// let total_ht = Money::from_units(1_000_000);
    /// assert_eq!(total_ht.calculate_tax(TaxRate::from_bps(1_800)), Some(Money::from_units(180_000)));
    /// ```
    pub fn calculate_tax(&self, rate: TaxRate) -> Option<Money> {
        let exact = self.0 as i128 * rate.bps() as i128;
        narrow(div_round_half_up(exact, 10_000))
    }

    /// `None` on `i64` overflow.
    #[inline]
    pub fn checked_add(self, other: Self) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
}

/// Display groups thousands with a space: `3 825 000`.
///
/// ## Note
/// This is for logs and debugging. The UI formats amounts with the
/// configured currency.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.0.unsigned_abs().to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(' ');
            }
            grouped.push(c);
        }
        if self.0 < 0 {
            write!(f, "-{}", grouped)
        } else {
            write!(f, "{}", grouped)
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

/// Plain addition for amounts already held under `MAX_AMOUNT`; use
/// [`Money::checked_add`] for anything derived from user input.
impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Percentage of `part` in `whole`, for display only.
///
/// Returns 0 when `whole` is zero. Never feed the result back into a
/// monetary computation.
pub fn percentage_of(part: Money, whole: Money) -> f64 {
    if whole.is_zero() {
        return 0.0;
    }
    part.units() as f64 / whole.units() as f64 * 100.0
}

// =============================================================================
// Fixed-point helpers
// =============================================================================

/// Formats a scaled integer as a decimal string without trailing zeros.
fn format_fixed(value: i64, decimals: u32) -> String {
    let scale = 10_i64.pow(decimals);
    let whole = value / scale;
    let frac = (value % scale).abs();
    let sign = if value < 0 && whole == 0 { "-" } else { "" };
    if frac == 0 {
        return format!("{}{}", sign, whole);
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}{}.{}", sign, whole, frac.trim_end_matches('0'))
}

/// Parses `"12"`, `"12.5"` or `"12,5"` into a scaled integer.
///
/// Rejects more than `decimals` fractional digits.
fn parse_fixed(input: &str, decimals: u32) -> Option<i64> {
    let input = input.trim();
    let (negative, body) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    let body = body.replace(',', ".");
    let (whole, frac) = match body.split_once('.') {
        Some((w, f)) => (w, f),
        None => (body.as_str(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > decimals as usize
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let scale = 10_i64.pow(decimals);
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_value: i64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        padded.parse().ok()?
    };
    let value = whole.checked_mul(scale)?.checked_add(frac_value)?;
    Some(if negative { -value } else { value })
}

/// Serde visitor accepting a decimal string, an integer or a float.
struct FixedVisitor {
    decimals: u32,
    expecting: &'static str,
}

impl<'de> Visitor<'de> for FixedVisitor {
    type Value = i64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.expecting)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        parse_fixed(v, self.decimals)
            .ok_or_else(|| E::custom(format!("invalid {}: {}", self.expecting, v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        v.checked_mul(10_i64.pow(self.decimals))
            .ok_or_else(|| E::custom("value out of range"))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        let v = i64::try_from(v).map_err(|_| E::custom("value out of range"))?;
        self.visit_i64(v)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
        let scaled = (v * 10_f64.powi(self.decimals as i32)).round();
        if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
            return Err(E::custom("value out of range"));
        }
        Ok(scaled as i64)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// A measured quantity with three decimals (thousandths of a unit).
///
/// Serialized as a decimal string (`"45"`, `"12.5"`); deserializes from a
/// string, an integer or a float.
///
/// No `TS` derive: fields of this type carry `#[ts(type = "string")]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(i64);

impl Quantity {
    /// Thousandths per unit.
    pub const SCALE: i64 = 1_000;
    const DECIMALS: u32 = 3;

    #[inline]
    pub const fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Quantity(units * Self::SCALE)
    }

    #[inline]
    pub const fn milli(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn zero() -> Self {
        Quantity(0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_fixed(self.0, Self::DECIMALS))
    }
}

impl FromStr for Quantity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, Self::DECIMALS)
            .map(Quantity)
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "quantite".to_string(),
                reason: "expected a number with at most 3 decimals".to_string(),
            })
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_any(FixedVisitor {
                decimals: Self::DECIMALS,
                expecting: "quantity with at most 3 decimals",
            })
            .map(Quantity)
    }
}

// =============================================================================
// Coefficient
// =============================================================================

/// A multiplier applied to a déboursé line, with four decimals.
///
/// Defaults to `1`. Must be strictly positive to be used in a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coefficient(i64);

impl Coefficient {
    /// Ten-thousandths per unit.
    pub const SCALE: i64 = 10_000;
    const DECIMALS: u32 = 4;

    /// The neutral coefficient, 1.0.
    pub const ONE: Coefficient = Coefficient(Self::SCALE);

    #[inline]
    pub const fn from_ten_thousandths(value: i64) -> Self {
        Coefficient(value)
    }

    #[inline]
    pub const fn ten_thousandths(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl Default for Coefficient {
    fn default() -> Self {
        Coefficient::ONE
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_fixed(self.0, Self::DECIMALS))
    }
}

impl FromStr for Coefficient {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, Self::DECIMALS)
            .map(Coefficient)
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "coefficient".to_string(),
                reason: "expected a number with at most 4 decimals".to_string(),
            })
    }
}

impl Serialize for Coefficient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Coefficient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_any(FixedVisitor {
                decimals: Self::DECIMALS,
                expecting: "coefficient with at most 4 decimals",
            })
            .map(Coefficient)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
