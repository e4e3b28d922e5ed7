use crate::error::BillingError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul};

/// A non-negative monetary value, such as the amount charged for a session.
///
/// Wraps `rust_decimal::Decimal` so currency math never goes through floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, BillingError> {
        if value >= Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(BillingError::ValidationError(
                "Amount must not be negative".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;
    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0.checked_mul(Decimal::from(rhs)).unwrap_or(Decimal::MAX))
    }
}

impl Div<i64> for Money {
    type Output = Self;
    fn div(self, rhs: i64) -> Self::Output {
        Self(self.0 / Decimal::from(rhs))
    }
}

/// The price attached to a session: per hour or per game depending on the
/// billing mode. Always strictly positive and bounded by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub struct Rate(Decimal);

impl Rate {
    pub fn new(value: Decimal, max: Decimal) -> Result<Self, BillingError> {
        if value <= Decimal::ZERO {
            return Err(BillingError::ValidationError(
                "Rate must be positive".to_string(),
            ));
        }
        if value > max {
            return Err(BillingError::ValidationError(format!(
                "Rate must not exceed {}",
                max.normalize()
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn as_money(&self) -> Money {
        Money(self.0)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}
