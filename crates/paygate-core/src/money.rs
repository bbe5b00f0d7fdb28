//! Fixed-decimal money values.
//!
//! Every monetary value in the gateway is an [`Amount`]: an unsigned count of
//! micro-units (6 fractional digits). The wire representation is a decimal
//! string with exactly six fractional digits (`"0.500000"`); parsing rejects
//! negatives and non-numeric input. Monetary correctness beyond representation
//! (double-entry, balances) is the ledger's job, not ours.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of micro-units per whole unit.
const SCALE: u64 = 1_000_000;

/// Maximum fractional digits accepted on parse.
const MAX_FRACTION_DIGITS: usize = 6;

/// Errors produced when parsing or combining amounts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}: not a decimal number")]
    NotNumeric(String),

    #[error("invalid amount {0:?}: negative amounts are not allowed")]
    Negative(String),

    #[error("invalid amount {0:?}: more than {MAX_FRACTION_DIGITS} fractional digits")]
    TooPrecise(String),

    #[error("amount arithmetic overflow")]
    Overflow,

    #[error("amount arithmetic underflow")]
    Underflow,
}

/// An unsigned fixed-decimal monetary amount in micro-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u64);

impl Amount {
    /// Zero monetary value.
    pub const ZERO: Amount = Amount(0);

    /// Builds an amount directly from micro-units.
    pub const fn from_micros(micros: u64) -> Self {
        Amount(micros)
    }

    /// Returns the raw micro-unit count.
    pub const fn micros(self) -> u64 {
        self.0
    }

    /// Returns true when the amount is zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Checked subtraction. Underflows (would-be-negative results) are errors.
    pub fn checked_sub(self, other: Amount) -> Result<Amount, AmountError> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(AmountError::Underflow)
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Splits this amount into `(fee, seller_share)` for a basis-point rate.
    ///
    /// `fee = floor(amount * bps / 10_000)`; the seller receives the rest.
    /// Neither side can go negative.
    pub fn fee_split(self, bps: u32) -> (Amount, Amount) {
        let fee = (u128::from(self.0) * u128::from(bps) / 10_000) as u64;
        let fee = fee.min(self.0);
        (Amount(fee), Amount(self.0 - fee))
    }

    /// Multiplies by a percentage, flooring. Used for warn-at thresholds.
    pub fn percent(self, pct: u32) -> Amount {
        Amount((u128::from(self.0) * u128::from(pct) / 100) as u64)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(AmountError::NotNumeric(s.to_string()));
        }
        if raw.starts_with('-') {
            return Err(AmountError::Negative(s.to_string()));
        }
        if raw.starts_with('+') {
            return Err(AmountError::NotNumeric(s.to_string()));
        }

        let (int_part, frac_part) = match raw.split_once('.') {
            Some((i, f)) => (i, f),
            None => (raw, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::NotNumeric(s.to_string()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountError::NotNumeric(s.to_string()));
        }
        if frac_part.len() > MAX_FRACTION_DIGITS {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| AmountError::NotNumeric(s.to_string()))?
        };

        let mut frac: u64 = if frac_part.is_empty() {
            0
        } else {
            frac_part
                .parse()
                .map_err(|_| AmountError::NotNumeric(s.to_string()))?
        };
        for _ in frac_part.len()..MAX_FRACTION_DIGITS {
            frac *= 10;
        }

        whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / SCALE, self.0 % SCALE)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
