//! Resource quantity arithmetic for aggregated node capacity
//!
//! Quantities are held as signed nano-units in an `i128`, which is exact for
//! every suffix Kubernetes accepts up to `E`/`Ei` with room to sum thousands
//! of nodes.

use vkube_common::{Error, Result};

const NANO: i128 = 1_000_000_000;

const DECIMAL_SUFFIXES: &[(&str, i128)] = &[
    ("n", 1),
    ("u", 1_000),
    ("m", 1_000_000),
    ("", NANO),
    ("k", 1_000 * NANO),
    ("M", 1_000_000 * NANO),
    ("G", 1_000_000_000 * NANO),
    ("T", 1_000_000_000_000 * NANO),
    ("P", 1_000_000_000_000_000 * NANO),
    ("E", 1_000_000_000_000_000_000 * NANO),
];

const BINARY_SUFFIXES: &[(&str, i128)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

fn invalid(input: &str, reason: &str) -> Error {
    Error::validation_for("quantity", format!("invalid quantity {input:?}: {reason}"))
}

/// Parse a quantity string into nano-units; sub-nano fractions truncate
pub fn parse_quantity(input: &str) -> Result<i128> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid(input, "missing number"));
    }

    let (negative, digits) = match number.as_bytes()[0] {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if (whole.is_empty() && frac.is_empty())
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid(input, "malformed number"));
    }

    // numerator / 10^scale, in base units
    let mut numerator: i128 = 0;
    for b in whole.bytes().chain(frac.bytes()) {
        numerator = numerator
            .checked_mul(10)
            .and_then(|n| n.checked_add(i128::from(b - b'0')))
            .ok_or_else(|| invalid(input, "overflow"))?;
    }
    let mut scale = frac.len() as i32;

    let multiplier = if let Some((_, m)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        m * NANO
    } else if let Some((_, m)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        *m
    } else if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        let exp: i32 = exp.parse().map_err(|_| invalid(input, "unknown suffix"))?;
        scale = scale
            .checked_sub(exp)
            .ok_or_else(|| invalid(input, "exponent out of range"))?;
        NANO
    } else {
        return Err(invalid(input, "unknown suffix"));
    };

    let mut value = numerator
        .checked_mul(multiplier)
        .ok_or_else(|| invalid(input, "overflow"))?;
    if scale > 0 {
        value /= 10i128
            .checked_pow(scale as u32)
            .ok_or_else(|| invalid(input, "too many fractional digits"))?;
    } else if scale < 0 {
        value = 10i128
            .checked_pow(scale.unsigned_abs())
            .and_then(|p| value.checked_mul(p))
            .ok_or_else(|| invalid(input, "overflow"))?;
    }
    Ok(if negative { -value } else { value })
}

/// Canonical rendering of nano-units.
///
/// Whole values use the largest exact binary suffix when `binary` is set;
/// fractional values use the coarsest exact `m`, `u` or `n` suffix.
pub fn format_quantity(nanos: i128, binary: bool) -> String {
    if nanos % NANO == 0 {
        let whole = nanos / NANO;
        if binary && whole != 0 {
            if let Some((sfx, m)) = BINARY_SUFFIXES.iter().rev().find(|(_, m)| whole % m == 0) {
                return format!("{}{}", whole / m, sfx);
            }
        }
        return whole.to_string();
    }
    for (sfx, m) in [("m", 1_000_000), ("u", 1_000)] {
        if nanos % m == 0 {
            return format!("{}{}", nanos / m, sfx);
        }
    }
    format!("{nanos}n")
}
