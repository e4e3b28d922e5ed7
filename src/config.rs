use crate::error::{BillingError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Tunables for billing math, timers and the push-payment poll loop.
///
/// Every field has a default so a partial JSON file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Loyalty points awarded per currency unit charged.
    pub points_per_currency_unit: Decimal,
    /// Upper bound accepted for a session rate.
    pub max_rate: Decimal,
    /// Length of one billable block for per-hour sessions.
    pub hourly_block_minutes: i64,
    /// Remaining time at which the countdown enters its warning state.
    pub warning_threshold_secs: u64,
    pub countdown_tick_secs: u64,
    pub elapsed_refresh_secs: u64,
    pub push_poll_interval_secs: u64,
    pub push_timeout_secs: u64,
    /// Shortest manual mobile-money reference accepted.
    pub min_reference_len: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            points_per_currency_unit: dec!(0.1),
            max_rate: dec!(100000),
            hourly_block_minutes: 60,
            warning_threshold_secs: 300,
            countdown_tick_secs: 1,
            elapsed_refresh_secs: 30,
            push_poll_interval_secs: 3,
            push_timeout_secs: 60,
            min_reference_len: 10,
        }
    }
}

impl BillingConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.points_per_currency_unit < Decimal::ZERO {
            return Err(BillingError::ValidationError(
                "points_per_currency_unit must not be negative".to_string(),
            ));
        }
        if self.hourly_block_minutes <= 0 {
            return Err(BillingError::ValidationError(
                "hourly_block_minutes must be positive".to_string(),
            ));
        }
        if self.push_poll_interval_secs == 0 || self.countdown_tick_secs == 0 {
            return Err(BillingError::ValidationError(
                "tick and poll intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.push_poll_interval_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_secs(self.countdown_tick_secs)
    }

    pub fn elapsed_refresh(&self) -> Duration {
        Duration::from_secs(self.elapsed_refresh_secs)
    }

    pub fn warning_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.warning_threshold_secs as i64)
    }
}

/// Credentials and endpoints for the Daraja (M-Pesa) STK push API.
#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: String,
}

impl DarajaConfig {
    pub fn from_env() -> Result<Self> {
        fn required(key: &str) -> Result<String> {
            std::env::var(key)
                .map_err(|_| BillingError::ValidationError(format!("{key} must be set")))
        }

        Ok(Self {
            consumer_key: required("MPESA_CONSUMER_KEY")?,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            short_code: required("MPESA_SHORT_CODE")?,
            passkey: required("MPESA_PASSKEY")?,
            callback_url: required("MPESA_CALLBACK_URL")?,
            environment: std::env::var("MPESA_ENVIRONMENT")
                .unwrap_or_else(|_| "sandbox".to_string()),
        })
    }

    pub fn base_url(&self) -> &'static str {
        if self.environment == "production" {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        }
    }

    pub fn auth_url(&self) -> String {
        format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.base_url()
        )
    }

    pub fn stk_push_url(&self) -> String {
        format!("{}/mpesa/stkpush/v1/processrequest", self.base_url())
    }
}
