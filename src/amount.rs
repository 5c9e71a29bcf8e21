//! Arbitrary-precision base-unit amounts and the decimal conversion used only at the CEX boundary.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

/// A non-negative integer amount in a token's smallest indivisible unit.
///
/// All accounting, persistence, and adapter boundaries use this type. Conversion to/from a
/// decimal human-readable string happens only at the CEX boundary, via [`Amount::to_decimal`] /
/// [`Amount::from_decimal`].
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(BigUint);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigUint::zero())
    }

    pub fn from_u64(v: u64) -> Self {
        Amount(BigUint::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Checked subtraction; returns `None` on underflow rather than panicking or wrapping.
    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        if self.0 < other.0 {
            None
        } else {
            Some(Amount(&self.0 - &other.0))
        }
    }

    pub fn checked_add(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// Renders this amount as a decimal string with `decimals` fractional digits.
    ///
    /// Left-pads the base-unit digit string to `decimals + 1` digits, then inserts the decimal
    /// point at `len - decimals`. E.g. `to_decimal(Amount(1), 8) == "0.00000001"`.
    pub fn to_decimal(&self, decimals: i32) -> String {
        let digits = self.0.to_str_radix(10);
        if decimals <= 0 {
            // Negative/zero decimals: trim `-decimals` whole-unit digits (multiply by 10^-decimals
            // conceptually means these are *already* whole units of a coarser denomination).
            let trim = (-decimals) as usize;
            if trim == 0 {
                return digits;
            }
            if digits.len() <= trim {
                return "0".to_string();
            }
            return digits[..digits.len() - trim].to_string();
        }
        let decimals = decimals as usize;
        let padded = if digits.len() < decimals + 1 {
            format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits)
        } else {
            digits
        };
        let split = padded.len() - decimals;
        format!("{}.{}", &padded[..split], &padded[split..])
    }

    /// Parses a decimal string into a base-unit amount with `decimals` fractional digits.
    ///
    /// Splits at `.`, truncates excess fractional digits, right-pads missing ones with `0`.
    /// Supports negative `decimals` by treating `s` as already denominated in a coarser unit.
    pub fn from_decimal(s: &str, decimals: i32) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty decimal string".to_string());
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if decimals <= 0 {
            let pad = (-decimals) as usize;
            let combined = format!("{whole}{}", "0".repeat(pad));
            let n = BigUint::from_str(&combined).map_err(|e| e.to_string())?;
            return Ok(Amount(n));
        }
        let decimals = decimals as usize;
        let frac = if frac.len() > decimals {
            &frac[..decimals]
        } else {
            frac
        };
        let combined = format!("{whole}{}{}", frac, "0".repeat(decimals - frac.len()));
        let n = BigUint::from_str(&combined).map_err(|e| e.to_string())?;
        Ok(Amount(n))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigUint::from_str(s).map(Amount).map_err(|e| e.to_string())
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_boundary_cases() {
        assert_eq!(Amount::from_u64(1).to_decimal(8), "0.00000001");
        assert_eq!(
            Amount::from_decimal("0.00000001", 8).unwrap(),
            Amount::from_u64(1)
        );
        assert_eq!(Amount::from_u64(100_000_000).to_decimal(8), "1.00000000");
        assert_eq!(
            Amount::from_decimal("1", 8).unwrap(),
            Amount::from_u64(100_000_000)
        );
    }

    #[test]
    fn round_trip_base_unit_to_decimal_to_base_unit() {
        for raw in [0u64, 1, 42, 100_000_000, 123_456_789_012_345] {
            for decimals in [0i32, 2, 6, 8, 9, 18] {
                let amount = Amount::from_u64(raw);
                let s = amount.to_decimal(decimals);
                let back = Amount::from_decimal(&s, decimals).unwrap();
                assert_eq!(amount, back, "raw={raw} decimals={decimals} s={s}");
            }
        }
    }

    #[test]
    fn from_decimal_truncates_excess_fractional_digits() {
        // 8 decimals requested, 9 fractional digits given -> truncate, don't round.
        assert_eq!(
            Amount::from_decimal("1.123456789", 8).unwrap(),
            Amount::from_decimal("1.12345678", 8).unwrap()
        );
    }

    #[test]
    fn checked_sub_detects_underflow() {
        let a = Amount::from_u64(5);
        let b = Amount::from_u64(10);
        assert!(a.checked_sub(&b).is_none());
        assert_eq!(b.checked_sub(&a), Some(Amount::from_u64(5)));
    }
}
