//! Decimal precision formatting
//!
//! Values are shortened by truncating their decimal string, never by rounding,
//! so the displayed digits are always a prefix of the computed ones. Inputs the
//! formatter cannot handle (no decimal point, negative precision) come back
//! unchanged.

use log::debug;
use rust_decimal::Decimal;

/// Truncate a decimal string to `precision` digits after the decimal point.
///
/// - `precision < 0` or no `.` in the input: the input is returned as-is.
/// - `precision == 0`: everything from the decimal point on is dropped.
/// - Otherwise the precision is clamped to the digits available; the result
///   is never padded with zeros.
pub fn truncate(decimal_string: &str, precision: i32) -> String {
    let Some(point) = decimal_string.find('.') else {
        debug!("No decimal point in {:?}, no adjustment done", decimal_string);
        return decimal_string.to_string();
    };
    if precision < 0 {
        debug!("Negative precision {} requested, no adjustment done", precision);
        return decimal_string.to_string();
    }

    let kept = if precision == 0 {
        &decimal_string[..point]
    } else {
        let available = digits_after_point(decimal_string, point);
        let keep = (precision as usize).min(available);
        &decimal_string[..point + 1 + keep]
    };
    without_negative_zero(kept).to_string()
}

/// `-0` and `-0.00` lose their sign once the nonzero digits are cut off
fn without_negative_zero(text: &str) -> &str {
    match text.strip_prefix('-') {
        Some(magnitude) if magnitude.chars().all(|c| c == '0' || c == '.') => magnitude,
        _ => text,
    }
}

/// Render `value` in its canonical decimal form, then truncate it.
pub fn truncate_decimal(value: &Decimal, precision: i32) -> String {
    truncate(&value.to_string(), precision)
}

/// Number of characters following the decimal point at byte index `point`.
fn digits_after_point(decimal_string: &str, point: usize) -> usize {
    decimal_string[point + 1..].chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_truncates_without_rounding() {
        assert_eq!(truncate("3.14159", 2), "3.14");
        assert_eq!(truncate("3.149", 1), "3.1");
        assert_eq!(truncate("2.999", 2), "2.99");
        assert_eq!(truncate("-7.89", 1), "-7.8");
    }

    #[test]
    fn test_no_decimal_point_is_unchanged() {
        assert_eq!(truncate("314", 2), "314");
        assert_eq!(truncate("314", 0), "314");
        assert_eq!(truncate("", 3), "");
    }

    #[test]
    fn test_clamps_instead_of_padding() {
        assert_eq!(truncate("3.1", 5), "3.1");
        assert_eq!(truncate("3.", 2), "3.");
        assert_eq!(truncate("10.25", 2), "10.25");
    }

    #[test]
    fn test_zero_precision_drops_fraction() {
        assert_eq!(truncate("70.26084", 0), "70");
        assert_eq!(truncate("0.99", 0), "0");
        assert_eq!(truncate(".5", 0), "");
    }

    #[test]
    fn test_truncated_negative_fraction_has_no_sign() {
        assert_eq!(truncate("-0.5", 0), "0");
        assert_eq!(truncate("-0.05", 1), "0.0");
        assert_eq!(truncate("-0.05", 2), "-0.05");
        assert_eq!(truncate("-1.5", 0), "-1");
    }

    #[test]
    fn test_negative_precision_is_noop() {
        assert_eq!(truncate("3.14159", -2), "3.14159");
        assert_eq!(truncate("3.14159", -1), "3.14159");
    }

    #[test]
    fn test_truncate_decimal() {
        let value = Decimal::from_str("70.26084").unwrap();
        assert_eq!(truncate_decimal(&value, 1), "70.2");
        assert_eq!(truncate_decimal(&value, 0), "70");

        // Trailing zeros carried by the decimal's scale are kept, not padded
        let scaled = Decimal::from_str("90.00").unwrap();
        assert_eq!(truncate_decimal(&scaled, 1), "90.0");
        assert_eq!(truncate_decimal(&scaled, 4), "90.00");

        let whole = Decimal::from(42);
        assert_eq!(truncate_decimal(&whole, 2), "42");
    }
}
