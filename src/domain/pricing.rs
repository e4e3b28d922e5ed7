//! Rate and points calculator.
//!
//! Pure functions over a billing mode, a rate and two instants. No clocks,
//! timers or stores are involved, so every rule here is unit-testable.

use super::money::{Money, Rate};
use super::session::{BillingMode, SettledBilling};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

/// Pricing constants taken from [`crate::config::BillingConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingPolicy {
    pub points_per_currency_unit: Decimal,
    pub block_minutes: i64,
}

impl From<&crate::config::BillingConfig> for PricingPolicy {
    fn from(config: &crate::config::BillingConfig) -> Self {
        Self {
            points_per_currency_unit: config.points_per_currency_unit,
            block_minutes: config.hourly_block_minutes,
        }
    }
}

/// Result of pricing a session at a given end instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BillingQuote {
    pub duration_minutes: i64,
    /// Hours charged for per-hour sessions, always 1 for per-game.
    pub billable_units: i64,
    pub amount: Money,
    pub points: u32,
}

/// Whole minutes between `start` and `end`, clamped at zero for clock skew.
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_minutes().max(0)
}

/// Hours billed for a per-hour session: rounded up, never less than one.
pub fn billable_hours(duration_minutes: i64, block_minutes: i64) -> i64 {
    let minutes = duration_minutes.max(0);
    (minutes / block_minutes + i64::from(minutes % block_minutes != 0)).max(1)
}

/// `floor(amount * k)`, saturating at `u32::MAX`.
pub fn points_for(amount: Money, points_per_currency_unit: Decimal) -> u32 {
    let raw = (amount.value() * points_per_currency_unit).floor();
    if raw <= Decimal::ZERO {
        0
    } else {
        raw.to_u32().unwrap_or(u32::MAX)
    }
}

/// Prices a session of `duration_minutes`.
pub fn quote_minutes(
    mode: BillingMode,
    rate: Rate,
    duration_minutes: i64,
    policy: PricingPolicy,
) -> BillingQuote {
    let duration_minutes = duration_minutes.max(0);
    let (billable_units, amount) = match mode {
        BillingMode::PerHour => {
            let hours = billable_hours(duration_minutes, policy.block_minutes);
            (hours, rate.as_money() * hours)
        }
        BillingMode::PerGame => (1, rate.as_money()),
    };
    BillingQuote {
        duration_minutes,
        billable_units,
        amount,
        points: points_for(amount, policy.points_per_currency_unit),
    }
}

/// Prices a session that started at `start` and ends at `end`.
pub fn quote(
    mode: BillingMode,
    rate: Rate,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: PricingPolicy,
) -> BillingQuote {
    quote_minutes(mode, rate, duration_minutes(start, end), policy)
}

impl BillingQuote {
    pub fn into_billing(self, end_time: DateTime<Utc>) -> SettledBilling {
        SettledBilling {
            end_time,
            duration_minutes: self.duration_minutes,
            amount_charged: self.amount,
            points_earned: self.points,
        }
    }
}
