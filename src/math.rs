//! Fixed-precision decimal arithmetic shared by every indicator formula.
//!
//! Intermediate results are kept to [`PRECISION`] significant digits with
//! half-up rounding. Values leaving the kernel are rounded to a fixed scale:
//! [`PRICE_SCALE`] for prices and volumes, [`PERCENT_SCALE`] for oscillators.
//! Nothing here depends on native floating point for a final value, so the
//! same inputs produce the same digits on every platform.

use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Significant digits kept for intermediate results.
pub const PRECISION: u32 = 18;
/// Fractional digits of persisted prices, volumes and bands.
pub const PRICE_SCALE: u32 = 8;
/// Fractional digits of the RSI family.
pub const PERCENT_SCALE: u32 = 4;
/// Newton-Raphson refinements applied after the floating-point seed.
pub const SQRT_ITERATIONS: usize = 10;

const HALF_UP: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// Round `value` to [`PRECISION`] significant digits, half-up.
///
/// Values whose integer part alone exceeds the precision are returned as-is;
/// they are far outside any price range this crate handles.
pub fn round_sig(value: Decimal) -> Decimal {
    if value.is_zero() {
        return value;
    }
    let digits = value.mantissa().unsigned_abs().ilog10() + 1;
    if digits <= PRECISION {
        return value;
    }
    let excess = digits - PRECISION;
    if excess > value.scale() {
        return value;
    }
    value.round_dp_with_strategy(value.scale() - excess, HALF_UP)
}

pub fn add(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_add(b).map(round_sig)
}

pub fn sub(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_sub(b).map(round_sig)
}

pub fn mul(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_mul(b).map(round_sig)
}

/// `None` on division by zero or overflow.
pub fn div(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_div(b).map(round_sig)
}

pub fn sum<I>(values: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| add(acc, v))
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    div(sum(values.iter().copied())?, Decimal::from(values.len()))
}

/// Round half-up to exactly `scale` fractional digits.
pub fn to_scale(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, HALF_UP);
    rounded.rescale(scale);
    rounded
}

pub fn to_price_scale(value: Decimal) -> Decimal {
    to_scale(value, PRICE_SCALE)
}

pub fn to_percent_scale(value: Decimal) -> Decimal {
    to_scale(value, PERCENT_SCALE)
}

/// Square root rounded to [`PRICE_SCALE`].
///
/// Seeds from an `f64` estimate, then runs exactly [`SQRT_ITERATIONS`]
/// Newton-Raphson steps at working precision. Zero short-circuits without
/// iterating; negative input yields `None`.
pub fn sqrt(value: Decimal) -> Option<Decimal> {
    if value.is_zero() {
        return Some(to_price_scale(Decimal::ZERO));
    }
    if value.is_sign_negative() {
        return None;
    }

    let mut x = value
        .to_f64()
        .map(f64::sqrt)
        .and_then(Decimal::from_f64)
        .filter(|seed| *seed > Decimal::ZERO)
        .map(round_sig)
        .unwrap_or(value);

    for _ in 0..SQRT_ITERATIONS {
        x = div(add(x, div(value, x)?)?, dec!(2))?;
    }

    Some(to_price_scale(x))
}
