//! Exact monetary amounts.
//!
//! Amounts are signed fixed-point values in minor units (e.g. paise/cents),
//! so all ledger arithmetic is exact integer addition and subtraction. Binary
//! floating point never appears anywhere in the balance path.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A signed monetary amount in minor units.
///
/// Positive amounts increase a party's balance, negative amounts decrease it.
/// All arithmetic is checked; overflow surfaces as [`DomainError::AmountOverflow`]
/// instead of wrapping.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Construct from minor units (e.g. `Amount::from_minor(50_000)` = 500.00).
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Amount) -> DomainResult<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(DomainError::AmountOverflow)
    }

    pub fn checked_sub(self, other: Amount) -> DomainResult<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(DomainError::AmountOverflow)
    }

    pub fn checked_neg(self) -> DomainResult<Amount> {
        self.0
            .checked_neg()
            .map(Amount)
            .ok_or(DomainError::AmountOverflow)
    }

    /// Absolute magnitude, used for the multi-leg symmetry check.
    pub fn checked_abs(self) -> DomainResult<Amount> {
        self.0
            .checked_abs()
            .map(Amount)
            .ok_or(DomainError::AmountOverflow)
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Rendered as major.minor with two decimals, e.g. -12.05.
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
