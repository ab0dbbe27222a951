//! Exact arithmetic on Kubernetes resource quantities.
//!
//! Quantities such as `"2"`, `"500m"`, `"4G"`, `"1536Mi"` or `"1e9"` are held
//! as `numerator / denominator` where the denominator is a power of ten, so
//! dividing memory by 1e6 or comparing CPU amounts never goes through floating
//! point.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Longest mantissa we accept; keeps every intermediate product inside `i128`.
const MAX_MANTISSA_DIGITS: usize = 30;
/// Largest power of ten applied to either side of the fraction.
const MAX_DECIMAL_EXPONENT: u32 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity {0:?} is empty")]
    Empty(String),
    #[error("quantity {0:?} is not a valid number")]
    InvalidNumber(String),
    #[error("quantity {0:?} has an unknown suffix")]
    UnknownSuffix(String),
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A parsed quantity, exact up to 30 significant digits.
#[derive(Debug, Clone, Copy)]
pub struct ParsedQuantity {
    numerator: i128,
    denominator: i128,
}

enum Suffix {
    Binary(u32),
    Decimal(i32),
}

impl ParsedQuantity {
    pub fn from_integer(value: i128) -> Self {
        Self {
            numerator: value,
            denominator: 1,
        }
    }

    /// Parse a quantity string in the cluster's canonical notation.
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty(input.to_string()));
        }

        let (negative, unsigned) = match raw.as_bytes()[0] {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }
        if frac_part.contains('.') {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }

        let digits = format!("{int_part}{frac_part}");
        let significant = digits.trim_start_matches('0');
        if significant.len() > MAX_MANTISSA_DIGITS {
            return Err(QuantityError::OutOfRange(input.to_string()));
        }
        let mut numerator: i128 = if significant.is_empty() {
            0
        } else {
            significant
                .parse()
                .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?
        };
        let mut decimal_exponent = -(i32::try_from(frac_part.len())
            .map_err(|_| QuantityError::OutOfRange(input.to_string()))?);

        match parse_suffix(suffix).ok_or_else(|| QuantityError::UnknownSuffix(input.to_string()))? {
            Suffix::Binary(shift) => {
                numerator = numerator
                    .checked_mul(1_i128 << shift)
                    .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
            }
            Suffix::Decimal(exponent) => decimal_exponent += exponent,
        }

        let mut denominator: i128 = 1;
        let scale = pow10(decimal_exponent.unsigned_abs())
            .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
        if decimal_exponent >= 0 {
            numerator = numerator
                .checked_mul(scale)
                .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
        } else {
            denominator = scale;
        }

        if negative {
            numerator = -numerator;
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.numerator == 0
    }

    /// Smallest integer greater than or equal to the quantity.
    pub fn ceil_integer(&self) -> i128 {
        let truncated = self.numerator / self.denominator;
        if self.numerator % self.denominator > 0 {
            truncated + 1
        } else {
            truncated
        }
    }

    /// The quantity as an integer, if it has no fractional part.
    pub fn exact_integer(&self) -> Option<i128> {
        (self.numerator % self.denominator == 0).then(|| self.numerator / self.denominator)
    }
}

fn parse_suffix(suffix: &str) -> Option<Suffix> {
    let parsed = match suffix {
        "" => Suffix::Decimal(0),
        "Ki" => Suffix::Binary(10),
        "Mi" => Suffix::Binary(20),
        "Gi" => Suffix::Binary(30),
        "Ti" => Suffix::Binary(40),
        "Pi" => Suffix::Binary(50),
        "Ei" => Suffix::Binary(60),
        "n" => Suffix::Decimal(-9),
        "u" => Suffix::Decimal(-6),
        "m" => Suffix::Decimal(-3),
        "k" => Suffix::Decimal(3),
        "M" => Suffix::Decimal(6),
        "G" => Suffix::Decimal(9),
        "T" => Suffix::Decimal(12),
        "P" => Suffix::Decimal(15),
        "E" => Suffix::Decimal(18),
        other => {
            let exponent = other.strip_prefix(['e', 'E'])?;
            let exponent: i32 = exponent.parse().ok()?;
            if exponent.unsigned_abs() > MAX_DECIMAL_EXPONENT {
                return None;
            }
            Suffix::Decimal(exponent)
        }
    };
    Some(parsed)
}

fn pow10(exponent: u32) -> Option<i128> {
    if exponent > MAX_DECIMAL_EXPONENT + MAX_MANTISSA_DIGITS as u32 {
        return None;
    }
    10_i128.checked_pow(exponent)
}

impl PartialEq for ParsedQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ParsedQuantity {}

impl PartialOrd for ParsedQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.numerator.checked_mul(other.denominator);
        let rhs = other.numerator.checked_mul(self.denominator);
        match (lhs, rhs) {
            (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
            // only reachable for values near the parser limits
            _ => {
                let lhs = self.numerator as f64 / self.denominator as f64;
                let rhs = other.numerator as f64 / other.denominator as f64;
                lhs.total_cmp(&rhs)
            }
        }
    }
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exact_integer() {
            Some(value) => write!(f, "{value}"),
            None => write!(f, "{}/{}", self.numerator, self.denominator),
        }
    }
}
