//! Decimal helpers for prices and deltas
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! Deltas are rounded to `DELTA_SCALE` decimal places with half-to-even
//! rounding; that scale is part of the output contract.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::TypeError;

/// Decimal places kept on every emitted delta.
pub const DELTA_SCALE: u32 = 4;

/// Round a raw price difference to the published delta precision.
///
/// The result always carries exactly `DELTA_SCALE` places, so `5` prints as `5.0000`.
pub fn round_delta(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(DELTA_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(DELTA_SCALE);
    rounded
}

/// Parse a price from its textual form.
///
/// Accepts plain decimals ("105.25") and scientific notation ("1.5e-7").
pub fn parse_price(raw: &str) -> Result<Decimal, TypeError> {
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| TypeError::InvalidPrice {
            value: raw.to_string(),
        })
}

/// Convert a float price as received on the wire.
///
/// Goes through the shortest round-trip text form so that `0.1` becomes
/// exactly `0.1` rather than its binary expansion.
pub fn price_from_f64(value: f64) -> Result<Decimal, TypeError> {
    if !value.is_finite() {
        return Err(TypeError::InvalidPrice {
            value: value.to_string(),
        });
    }
    parse_price(&value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_round_delta_pads_to_scale() {
        assert_eq!(round_delta(dec("5")).to_string(), "5.0000");
        assert_eq!(round_delta(dec("1.5")).to_string(), "1.5000");
        assert_eq!(round_delta(dec("-0.25")).to_string(), "-0.2500");
        assert_eq!(round_delta(dec("1.23456")).to_string(), "1.2346");
    }

    #[test]
    fn test_round_delta_truncates_to_scale() {
        assert_eq!(round_delta(dec("1.234567")), dec("1.2346"));
        assert_eq!(round_delta(dec("-0.00006")), dec("-0.0001"));
    }

    #[test]
    fn test_round_delta_half_even() {
        assert_eq!(round_delta(dec("0.12345")), dec("0.1234"));
        assert_eq!(round_delta(dec("0.12355")), dec("0.1236"));
    }

    #[test]
    fn test_round_delta_keeps_whole_numbers() {
        assert_eq!(round_delta(dec("5")), dec("5.0"));
    }

    #[test]
    fn test_parse_price_plain_and_scientific() {
        assert_eq!(parse_price("105.25").unwrap(), dec("105.25"));
        assert_eq!(parse_price(" 42 ").unwrap(), dec("42"));
        assert_eq!(parse_price("1.5e-3").unwrap(), dec("0.0015"));
    }

    #[test]
    fn test_parse_price_rejects_garbage() {
        assert!(matches!(
            parse_price("abc"),
            Err(TypeError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn test_price_from_f64() {
        assert_eq!(price_from_f64(0.1).unwrap(), dec("0.1"));
        assert_eq!(price_from_f64(105.0).unwrap(), dec("105"));
        assert!(price_from_f64(f64::NAN).is_err());
        assert!(price_from_f64(f64::INFINITY).is_err());
    }
}
