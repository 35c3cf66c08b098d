//! Decimal policy shared by every component.
//!
//! All monetary values are `rust_decimal::Decimal`. Amounts carry at most 18
//! fractional digits, prices at most 8 (configurable per market). Arithmetic
//! on the hot path goes through the checked helpers here so overflow is an
//! explicit error instead of a panic or silent wrap.

use rust_decimal::{Decimal, RoundingStrategy};

/// Maximum fractional digits for order amounts.
pub const AMOUNT_SCALE: u32 = 18;

/// Default maximum fractional digits for prices.
pub const PRICE_SCALE: u32 = 8;

/// Decimal parsing/arithmetic failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    #[error("not a valid decimal: {0}")]
    Malformed(String),

    #[error("too many fractional digits (max {max}): {value}")]
    ExcessScale { value: String, max: u32 },

    #[error("value must be positive: {0}")]
    NonPositive(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("arithmetic overflow")]
    Overflow,

    #[error("division by zero")]
    DivisionByZero,
}

fn parse_positive(s: &str, max_scale: u32) -> Result<Decimal, DecimalError> {
    let value: Decimal = s
        .trim()
        .parse()
        .map_err(|_| DecimalError::Malformed(s.to_string()))?;
    let value = value.normalize();
    if value.scale() > max_scale {
        return Err(DecimalError::ExcessScale {
            value: s.to_string(),
            max: max_scale,
        });
    }
    if value <= Decimal::ZERO {
        return Err(DecimalError::NonPositive(s.to_string()));
    }
    Ok(value)
}

/// Parse an order amount from its ingress string form.
pub fn parse_amount(s: &str) -> Result<Decimal, DecimalError> {
    parse_positive(s, AMOUNT_SCALE)
}

/// Parse a limit price from its ingress string form.
pub fn parse_price(s: &str, max_scale: u32) -> Result<Decimal, DecimalError> {
    parse_positive(s, max_scale)
}

/// Checked multiply, rounded to `scale` fractional digits.
pub fn mul_round(
    a: Decimal,
    b: Decimal,
    scale: u32,
    strategy: RoundingStrategy,
) -> Result<Decimal, DecimalError> {
    a.checked_mul(b)
        .map(|v| v.round_dp_with_strategy(scale, strategy))
        .ok_or(DecimalError::Overflow)
}

/// Checked divide, rounded to `scale` fractional digits.
pub fn div_round(
    a: Decimal,
    b: Decimal,
    scale: u32,
    strategy: RoundingStrategy,
) -> Result<Decimal, DecimalError> {
    if b.is_zero() {
        return Err(DecimalError::DivisionByZero);
    }
    a.checked_div(b)
        .map(|v| v.round_dp_with_strategy(scale, strategy))
        .ok_or(DecimalError::Overflow)
}
