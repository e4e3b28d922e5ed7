use crate::error::BillingError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Local mobile-money subscriber numbers: `07XXXXXXXX`, `01[01]XXXXXXX`,
/// optionally written with the `254` / `+254` country prefix instead of `0`.
static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\+?254|0)?((?:7\d|1[01])\d{7})$").expect("phone pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    Cash,
    MobileMoneyManual,
    MobileMoneyPush,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Cash => f.write_str("cash"),
            PaymentMethod::MobileMoneyManual => f.write_str("mobile-money-manual"),
            PaymentMethod::MobileMoneyPush => f.write_str("mobile-money-push"),
        }
    }
}

/// A phone number accepted by the mobile-money carrier, stored in the
/// international `2547XXXXXXXX` form the gateway expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self, BillingError> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let captures = PHONE_PATTERN.captures(&compact).ok_or_else(|| {
            BillingError::ValidationError(format!(
                "'{}' is not a valid mobile-money number",
                raw.trim()
            ))
        })?;
        Ok(Self(format!("254{}", &captures[1])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a manually typed mobile-money receipt code.
pub fn parse_reference(raw: &str, min_len: usize) -> Result<String, BillingError> {
    let reference = raw.trim().to_uppercase();
    if reference.is_empty() {
        return Err(BillingError::ValidationError(
            "A mobile-money reference is required".to_string(),
        ));
    }
    if !reference.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BillingError::ValidationError(
            "Reference must be letters and digits only".to_string(),
        ));
    }
    if reference.len() < min_len {
        return Err(BillingError::ValidationError(format!(
            "Reference must be at least {min_len} characters"
        )));
    }
    Ok(reference)
}

/// What staff entered for the chosen payment method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentInput {
    Cash,
    MobileMoneyManual { reference: String },
    MobileMoneyPush { phone: String },
}

impl PaymentInput {
    pub fn method(&self) -> PaymentMethod {
        match self {
            PaymentInput::Cash => PaymentMethod::Cash,
            PaymentInput::MobileMoneyManual { .. } => PaymentMethod::MobileMoneyManual,
            PaymentInput::MobileMoneyPush { .. } => PaymentMethod::MobileMoneyPush,
        }
    }
}

/// A completed capture. Only values of this type can be committed, so a
/// push payment that never reached success cannot settle a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum CapturedPayment {
    Cash,
    MobileMoneyManual {
        reference: String,
    },
    MobileMoneyPush {
        phone: PhoneNumber,
        reference: String,
    },
}

impl CapturedPayment {
    pub fn method(&self) -> PaymentMethod {
        match self {
            CapturedPayment::Cash => PaymentMethod::Cash,
            CapturedPayment::MobileMoneyManual { .. } => PaymentMethod::MobileMoneyManual,
            CapturedPayment::MobileMoneyPush { .. } => PaymentMethod::MobileMoneyPush,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            CapturedPayment::Cash => None,
            CapturedPayment::MobileMoneyManual { reference }
            | CapturedPayment::MobileMoneyPush { reference, .. } => Some(reference),
        }
    }
}

/// State of one push request within a settlement dialog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttemptState {
    #[default]
    Idle,
    Sending,
    Pending,
    Success {
        reference: String,
    },
    Error {
        message: String,
    },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Success { .. } | AttemptState::Error { .. })
    }
}

/// Snapshot of a push attempt as observed by the settlement dialog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentAttempt {
    pub state: AttemptState,
    /// Time since the push was sent.
    pub elapsed: Duration,
}

impl PaymentAttempt {
    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            AttemptState::Error { message } => Some(message),
            _ => None,
        }
    }
}
