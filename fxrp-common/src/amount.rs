//! Fixed-point token amounts.
//!
//! XRP drops and FXRP base units share the same scale (6 decimals), so a single
//! amount type is used on both sides of the bridge. Amounts serialise as decimal
//! strings (`"99.750000"`) to avoid float rounding anywhere in the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of decimals carried by every amount.
pub const AMOUNT_DECIMALS: u32 = 6;

const SCALE: u128 = 10u128.pow(AMOUNT_DECIMALS);

/// Errors produced while parsing amounts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,

    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount {0} has more than {AMOUNT_DECIMALS} decimals")]
    TooPrecise(String),

    #[error("amount overflow")]
    Overflow,
}

/// Unsigned fixed-point amount with [`AMOUNT_DECIMALS`] decimals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build an amount from base units (drops / UBA).
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Build an amount from whole units.
    pub fn from_units(units: u64) -> Self {
        Self(units as u128 * SCALE)
    }

    /// Base units.
    pub const fn raw(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Apply a fee in basis points, rounding the fee down.
    pub fn fee_bips(self, bips: u32) -> Amount {
        Amount(self.0 * bips as u128 / 10_000)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / SCALE, self.0 % SCALE)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }

        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if whole.is_empty() && frac.is_empty() || !all_digits(whole) || !all_digits(frac) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if frac.len() > AMOUNT_DECIMALS as usize {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| AmountError::Overflow)?
        };
        let mut frac_raw: u128 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| AmountError::Invalid(s.to_string()))?
        };
        for _ in frac.len()..AMOUNT_DECIMALS as usize {
            frac_raw *= 10;
        }

        whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac_raw))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_six_decimals() {
        assert_eq!(Amount::from_raw(99_750_000).to_string(), "99.750000");
        assert_eq!(Amount::from_raw(1).to_string(), "0.000001");
        assert_eq!(Amount::from_units(100).to_string(), "100.000000");
    }

    #[test]
    fn parses_partial_decimals() {
        assert_eq!("19.995".parse::<Amount>().unwrap().raw(), 19_995_000);
        assert_eq!("100".parse::<Amount>().unwrap().raw(), 100_000_000);
        assert_eq!(".5".parse::<Amount>().unwrap().raw(), 500_000);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("".parse::<Amount>(), Err(AmountError::Empty));
        assert!(matches!("-1".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!("1.0000001".parse::<Amount>(), Err(AmountError::TooPrecise(_))));
        assert!(matches!(".".parse::<Amount>(), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn fee_rounds_down() {
        let total = Amount::from_units(100);
        assert_eq!(total.fee_bips(25).raw(), 250_000);
        assert_eq!(Amount::from_raw(3).fee_bips(25).raw(), 0);
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Amount::from_raw(19_995_000)).unwrap();
        assert_eq!(json, "\"19.995000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw(), 19_995_000);
    }
}
