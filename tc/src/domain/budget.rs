//! Fixed-point budget amounts
//!
//! Budgets are held in milli-units so that conservation checks across a whole
//! cell tree are exact. Configuration and output use fractional units.

use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An amount of computational budget, in milli-units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Budget(u64);

impl Budget {
    pub const ZERO: Budget = Budget(0);

    /// Milli-units per unit
    pub const SCALE: u64 = 1000;

    /// Build from fractional units; negative or non-finite input is zero
    pub fn from_units(units: f64) -> Self {
        if !units.is_finite() || units <= 0.0 {
            return Self::ZERO;
        }
        Self((units * Self::SCALE as f64).round() as u64)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn millis(self) -> u64 {
        self.0
    }

    pub fn units(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Budget) -> Option<Budget> {
        self.0.checked_add(other.0).map(Budget)
    }

    pub fn checked_sub(self, other: Budget) -> Option<Budget> {
        self.0.checked_sub(other.0).map(Budget)
    }

    pub fn saturating_add(self, other: Budget) -> Budget {
        Budget(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Budget) -> Budget {
        Budget(self.0.saturating_sub(other.0))
    }

    /// Multiply by a factor, rounding down. Factors outside `[0, 1]` are clamped.
    pub fn scale(self, factor: f64) -> Budget {
        if !factor.is_finite() || factor <= 0.0 {
            return Self::ZERO;
        }
        if factor >= 1.0 {
            return self;
        }
        // nudge so products like 10_000 * 0.15 do not floor one milli short
        Budget((self.0 as f64 * factor + 1e-6).floor() as u64)
    }

    /// Share of `whole` this amount represents (0.0 when `whole` is zero)
    pub fn ratio_of(self, whole: Budget) -> f64 {
        if whole.is_zero() {
            return 0.0;
        }
        self.0 as f64 / whole.0 as f64
    }
}

impl Add for Budget {
    type Output = Budget;

    fn add(self, rhs: Budget) -> Budget {
        self.saturating_add(rhs)
    }
}

impl Sum for Budget {
    fn sum<I: Iterator<Item = Budget>>(iter: I) -> Budget {
        iter.fold(Budget::ZERO, Budget::saturating_add)
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl Serialize for Budget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.units())
    }
}

impl<'de> Deserialize<'de> for Budget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let units = f64::deserialize(deserializer)?;
        if !units.is_finite() || units < 0.0 {
            return Err(serde::de::Error::custom(format!("budget must be a non-negative number, got {}", units)));
        }
        Ok(Budget::from_units(units))
    }
}
