//! Kubernetes resource quantity algebra.
//!
//! Quantities (`500m`, `2Gi`, `129e6`) are parsed into an exact integer
//! number of nano-units so that quota rollups accumulate without float
//! drift and render identically run over run.

use std::iter::Sum;
use std::ops::Add;

use thiserror::Error;

const NANO: i128 = 1_000_000_000;

/// An exact resource quantity, stored as nano-units.
///
/// For CPU the base unit is one core (so `1` is `1_000_000_000` nanos and
/// `500m` is `500_000_000`); for memory and storage the base unit is one
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Quantity {
    pub nanos: i128,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { nanos: 0 };

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// Whole milli-units, rounding toward zero.
    pub fn millis(&self) -> i128 {
        self.nanos / 1_000_000
    }

    /// Whole base units (cores or bytes), rounding toward zero.
    pub fn units(&self) -> i128 {
        self.nanos / NANO
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity {
            nanos: self.nanos.saturating_add(rhs.nanos),
        }
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid quantity {input:?}: {reason}")]
pub struct QuantityParseError {
    pub input: String,
    pub reason: String,
}

fn err(input: &str, reason: &str) -> QuantityParseError {
    QuantityParseError {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a Kubernetes quantity string.
///
/// Supported forms: plain decimals (`2`, `1.5`), decimal-exponent notation
/// (`129e6`), SI suffixes (`n u m k M G T P E`) and binary suffixes
/// (`Ki Mi Gi Ti Pi Ei`). Negative quantities are rejected; this algebra
/// only ever aggregates requested capacity.
pub fn parse_quantity(input: &str) -> Result<Quantity, QuantityParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(err(input, "empty"));
    }
    if s.starts_with('-') {
        return Err(err(input, "negative quantities not supported"));
    }

    // Binary suffixes first: they are two characters and would otherwise be
    // misread as a decimal suffix followed by junk.
    let (number, pow10_suffix, binary_pow) = if let Some(rest) = strip_binary_suffix(s, "Ki") {
        (rest, 0, 1)
    } else if let Some(rest) = strip_binary_suffix(s, "Mi") {
        (rest, 0, 2)
    } else if let Some(rest) = strip_binary_suffix(s, "Gi") {
        (rest, 0, 3)
    } else if let Some(rest) = strip_binary_suffix(s, "Ti") {
        (rest, 0, 4)
    } else if let Some(rest) = strip_binary_suffix(s, "Pi") {
        (rest, 0, 5)
    } else if let Some(rest) = strip_binary_suffix(s, "Ei") {
        (rest, 0, 6)
    } else {
        match s.chars().last() {
            Some('n') => (&s[..s.len() - 1], -9, 0),
            Some('u') => (&s[..s.len() - 1], -6, 0),
            Some('m') => (&s[..s.len() - 1], -3, 0),
            Some('k') => (&s[..s.len() - 1], 3, 0),
            Some('M') => (&s[..s.len() - 1], 6, 0),
            Some('G') => (&s[..s.len() - 1], 9, 0),
            Some('T') => (&s[..s.len() - 1], 12, 0),
            Some('P') => (&s[..s.len() - 1], 15, 0),
            // A trailing `E` is the exa suffix; exponent notation always has
            // digits after the `e`/`E` and is handled below.
            Some('E') => (&s[..s.len() - 1], 18, 0),
            _ => (s, 0, 0),
        }
    };

    if number.is_empty() {
        return Err(err(input, "missing digits"));
    }

    // Split an optional decimal exponent (`129e6`).
    let (mantissa, exp) = match number.split_once(['e', 'E']) {
        Some((m, e)) => {
            let exp: i32 = e.parse().map_err(|_| err(input, "bad exponent"))?;
            (m, exp)
        }
        None => (number, 0),
    };

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(err(input, "missing digits"));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(err(input, "non-numeric mantissa"));
    }

    let mut digits: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        digits = digits
            .checked_mul(10)
            .and_then(|d| d.checked_add((c as u8 - b'0') as i128))
            .ok_or_else(|| err(input, "overflow"))?;
    }

    // nanos = digits * 10^(9 + exp + suffix - frac_len) * 1024^binary_pow
    let mut pow10 = 9 + exp + pow10_suffix - frac_part.len() as i32;
    let mut nanos = digits;
    while pow10 > 0 {
        nanos = nanos.checked_mul(10).ok_or_else(|| err(input, "overflow"))?;
        pow10 -= 1;
    }
    while pow10 < 0 {
        nanos /= 10;
        pow10 += 1;
    }
    for _ in 0..binary_pow {
        nanos = nanos
            .checked_mul(1024)
            .ok_or_else(|| err(input, "overflow"))?;
    }

    Ok(Quantity { nanos })
}

fn strip_binary_suffix<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    s.strip_suffix(suffix)
}

/// Render a CPU quantity in milli-cores (`1500m`), the stable unit used in
/// plan artifacts.
pub fn format_cpu(q: Quantity) -> String {
    format!("{}m", q.millis())
}

/// Render a byte quantity, preferring the largest binary suffix that divides
/// it exactly (`512Mi`), falling back to raw bytes.
pub fn format_bytes(q: Quantity) -> String {
    let bytes = q.units();
    if bytes == 0 {
        return "0".to_string();
    }
    let suffixes = [("Ei", 6u32), ("Pi", 5), ("Ti", 4), ("Gi", 3), ("Mi", 2), ("Ki", 1)];
    for (suffix, pow) in suffixes {
        let unit = 1024i128.pow(pow);
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Serde adapter: CPU quantities as milli-core strings.
pub mod serde_cpu {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::{Quantity, format_cpu, parse_quantity};

    pub fn serialize<S: Serializer>(q: &Quantity, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_cpu(*q))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Quantity, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_quantity(&s).map_err(D::Error::custom)
    }
}

/// Serde adapter: memory/storage quantities as byte strings with binary
/// suffixes.
pub mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::{Quantity, format_bytes, parse_quantity};

    pub fn serialize<S: Serializer>(q: &Quantity, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_bytes(*q))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Quantity, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_quantity(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_plain_and_milli_cpu() {
        assert_eq!(parse_quantity("1").unwrap().millis(), 1000);
        assert_eq!(parse_quantity("500m").unwrap().millis(), 500);
        assert_eq!(parse_quantity("1.5").unwrap().millis(), 1500);
        assert_eq!(parse_quantity("0.1").unwrap().millis(), 100);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap().units(), 1024);
        assert_eq!(parse_quantity("2Gi").unwrap().units(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("1.5Gi").unwrap().units(), 1024 * 1024 * 1024 * 3 / 2);
    }

    #[test]
    fn parses_decimal_suffixes_and_exponents() {
        assert_eq!(parse_quantity("129e6").unwrap().units(), 129_000_000);
        assert_eq!(parse_quantity("100k").unwrap().units(), 100_000);
        assert_eq!(parse_quantity("1G").unwrap().units(), 1_000_000_000);
        assert_eq!(parse_quantity("100n").unwrap().nanos, 100);
        assert_eq!(parse_quantity("250u").unwrap().nanos, 250_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("-1").is_err());
        assert!(parse_quantity("abc").is_err());
        assert!(parse_quantity("1.2.3").is_err());
        assert!(parse_quantity("Ki").is_err());
    }

    #[test]
    fn formats_cpu_in_millicores() {
        assert_eq!(format_cpu(parse_quantity("1.5").unwrap()), "1500m");
        assert_eq!(format_cpu(parse_quantity("250m").unwrap()), "250m");
    }

    #[test]
    fn formats_bytes_with_binary_suffix_when_exact() {
        assert_eq!(format_bytes(parse_quantity("512Mi").unwrap()), "512Mi");
        assert_eq!(format_bytes(parse_quantity("2Gi").unwrap()), "2Gi");
        assert_eq!(format_bytes(parse_quantity("1000").unwrap()), "1000");
        assert_eq!(format_bytes(Quantity::ZERO), "0");
    }

    #[test]
    fn addition_accumulates() {
        let total: Quantity = ["100m", "250m", "1"]
            .iter()
            .map(|s| parse_quantity(s).unwrap())
            .sum();
        assert_eq!(total.millis(), 1350);
    }

    proptest! {
        #[test]
        fn parse_format_bytes_roundtrips(n in 0i128..1_000_000_000_000) {
            let q = Quantity { nanos: n * super::NANO };
            let rendered = format_bytes(q);
            let back = parse_quantity(&rendered).unwrap();
            prop_assert_eq!(q, back);
        }

        #[test]
        fn parse_never_panics(s in "\\PC{0,12}") {
            let _ = parse_quantity(&s);
        }
    }
}
