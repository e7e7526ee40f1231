//! Money Arithmetic Module
//!
//! All amounts are `rust_decimal::Decimal`. Derived amounts (FX credit leg,
//! agent commission) are rounded to 2 decimal places, half away from zero.
//! All rounding MUST go through this module.
//!
//! Request amounts are capped at [`MAX_AMOUNT`], and every sum or product
//! that can grow without bound uses checked arithmetic: an overflow surfaces
//! as a `LedgerError`, never as a panic.
//!
//! ## Usage
//! ```rust
//! use ledger_engine::money::{convert, split_commission};
//! use rust_decimal::Decimal;
//! use std::str::FromStr;
//!
//! let usd = Decimal::from_str("10.00").unwrap();
//! let rate = Decimal::from_str("131.255").unwrap();
//! assert_eq!(convert(usd, rate).unwrap().to_string(), "1312.55");
//!
//! let (fee, net) = split_commission(Decimal::from(1000), Decimal::from_str("0.015").unwrap()).unwrap();
//! assert_eq!(fee.to_string(), "15.00");
//! assert_eq!(net.to_string(), "985.00");
//! ```

use rust_decimal::prelude::*;

use crate::error::LedgerError;

/// Decimal places kept on derived amounts
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a single request may carry: 10^15
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xA4C6_8000, 0x0003_8D7E, 0, false, 0);

/// Round to cents, half away from zero
#[inline]
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Reject non-positive request amounts and amounts above [`MAX_AMOUNT`]
#[inline]
pub fn ensure_positive(amount: Decimal) -> Result<Decimal, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }
    ensure_within_limit(amount)
}

/// Reject amounts whose magnitude exceeds [`MAX_AMOUNT`]; sign is kept
#[inline]
pub fn ensure_within_limit(amount: Decimal) -> Result<Decimal, LedgerError> {
    if amount.abs() > MAX_AMOUNT {
        return Err(LedgerError::Validation(format!(
            "amount {} exceeds maximum {}",
            amount, MAX_AMOUNT
        )));
    }
    Ok(amount)
}

/// `a + b`, or `System` on overflow
#[inline]
pub fn checked_sum(a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
    a.checked_add(b)
        .ok_or_else(|| LedgerError::System(format!("decimal overflow adding {} and {}", a, b)))
}

/// `a - b`, or `System` on overflow
#[inline]
pub fn checked_diff(a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
    a.checked_sub(b).ok_or_else(|| {
        LedgerError::System(format!("decimal overflow subtracting {} from {}", b, a))
    })
}

/// `a × b`, or `Validation` on overflow (only request data is multiplied)
#[inline]
fn checked_product(a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
    a.checked_mul(b)
        .ok_or_else(|| LedgerError::Validation(format!("{} x {} is out of range", a, b)))
}

/// Convert a source amount at `rate`: `round(amount × rate, 2)`
pub fn convert(amount: Decimal, rate: Decimal) -> Result<Decimal, LedgerError> {
    Ok(round_money(checked_product(amount, rate)?))
}

/// Split a cash-out into `(fee, net)` where `fee = round(amount × rate, 2)`
/// and `net = amount - fee`.
pub fn split_commission(amount: Decimal, rate: Decimal) -> Result<(Decimal, Decimal), LedgerError> {
    let fee = round_money(checked_product(amount, rate)?);
    let mut net = checked_diff(amount, fee)?;
    net.rescale(net.scale().max(MONEY_SCALE));
    Ok((fee, net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(1.004)), dec!(1.00));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn test_ensure_positive() {
        assert_eq!(ensure_positive(dec!(0.01)), Ok(dec!(0.01)));
        assert_eq!(ensure_positive(Decimal::ZERO), Err(LedgerError::InvalidAmount));
        assert_eq!(ensure_positive(dec!(-5)), Err(LedgerError::InvalidAmount));
        assert_eq!(ensure_positive(MAX_AMOUNT), Ok(MAX_AMOUNT));
        assert!(matches!(
            ensure_positive(MAX_AMOUNT + dec!(0.01)),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ensure_positive(Decimal::MAX),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_max_amount_value() {
        assert_eq!(MAX_AMOUNT, dec!(1_000_000_000_000_000));
        assert_eq!(ensure_within_limit(-MAX_AMOUNT), Ok(-MAX_AMOUNT));
        assert!(ensure_within_limit(-MAX_AMOUNT - dec!(1)).is_err());
    }

    #[test]
    fn test_overflow_is_an_error() {
        assert!(matches!(
            checked_sum(Decimal::MAX, dec!(1)),
            Err(LedgerError::System(_))
        ));
        assert!(matches!(
            checked_diff(Decimal::MIN, dec!(1)),
            Err(LedgerError::System(_))
        ));
        assert!(matches!(
            convert(Decimal::MAX, dec!(2)),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(checked_sum(dec!(1.5), dec!(2)), Ok(dec!(3.5)));
    }

    #[test]
    fn test_convert() {
        assert_eq!(convert(dec!(100), dec!(0.0076)), Ok(dec!(0.76)));
        assert_eq!(convert(dec!(33.33), dec!(1.5)), Ok(dec!(50.00)));
    }

    #[test]
    fn test_split_commission() {
        let (fee, net) = split_commission(dec!(1000), dec!(0.01)).unwrap();
        assert_eq!(fee, dec!(10.00));
        assert_eq!(net, dec!(990.00));
        assert_eq!(fee + net, dec!(1000));

        let (fee, net) = split_commission(dec!(333), dec!(0.0125)).unwrap();
        assert_eq!(fee, dec!(4.16));
        assert_eq!(net, dec!(328.84));
    }

    #[test]
    fn test_zero_commission() {
        let (fee, net) = split_commission(dec!(50), Decimal::ZERO).unwrap();
        assert_eq!(fee, Decimal::ZERO);
        assert_eq!(net, dec!(50));
    }
}
