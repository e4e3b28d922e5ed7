use super::money::{Money, Rate};
use super::payment::CapturedPayment;
use crate::error::BillingError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(pub u32);

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationId(pub u32);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingMode {
    PerHour,
    PerGame,
}

impl fmt::Display for BillingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingMode::PerHour => f.write_str("per-hour"),
            BillingMode::PerGame => f.write_str("per-game"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => f.write_str("pending"),
            PaymentStatus::Paid => f.write_str("paid"),
            PaymentStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Where a row sits in its lifecycle.
///
/// Finer than [`PaymentStatus`]: the mobile-money webhook may mark a row paid
/// before settlement has written its billing, and conditional updates must
/// tell that row apart from a settled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Open,
    /// Paid at the gateway, billing not yet recorded.
    AwaitingSettlement,
    Settled,
    Cancelled,
}

impl SessionStage {
    /// Settlement may still commit from this stage.
    pub fn is_settleable(&self) -> bool {
        matches!(self, SessionStage::Open | SessionStage::AwaitingSettlement)
    }
}

/// The billing snapshot frozen at settlement.
///
/// Grouped so the fields are either all absent (pending, forced end) or all
/// present (paid, voided).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledBilling {
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub amount_charged: Money,
    pub points_earned: u32,
}

/// Request to open a new session on a station.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub primary_customer: CustomerId,
    pub secondary_customer: Option<CustomerId>,
    pub station: StationId,
    pub game: String,
    pub mode: BillingMode,
    pub rate: Decimal,
}

impl NewSession {
    /// Checks participants and rate before anything is mutated.
    pub fn validate(&self, max_rate: Decimal) -> Result<Rate, BillingError> {
        if self.secondary_customer == Some(self.primary_customer) {
            return Err(BillingError::ValidationError(
                "Secondary customer must differ from the primary customer".to_string(),
            ));
        }
        if self.game.trim().is_empty() {
            return Err(BillingError::ValidationError(
                "A game must be selected".to_string(),
            ));
        }
        Rate::new(self.rate, max_rate)
    }
}

/// One customer-station-game billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub primary_customer: CustomerId,
    pub secondary_customer: Option<CustomerId>,
    pub station: StationId,
    pub game: String,
    pub mode: BillingMode,
    pub rate: Rate,
    pub start_time: DateTime<Utc>,
    pub billing: Option<SettledBilling>,
    pub status: PaymentStatus,
    pub payment: Option<CapturedPayment>,
    /// Receipt code written by the mobile-money webhook once the customer
    /// approves a push. The session stays pending until settlement commits.
    #[serde(default)]
    pub gateway_reference: Option<String>,
    #[serde(default)]
    pub notes: String,
}

impl Session {
    /// Builds a pending session from a validated request.
    pub fn open(id: SessionId, request: NewSession, rate: Rate, now: DateTime<Utc>) -> Self {
        Self {
            id,
            primary_customer: request.primary_customer,
            secondary_customer: request.secondary_customer,
            station: request.station,
            game: request.game,
            mode: request.mode,
            rate,
            start_time: now,
            billing: None,
            status: PaymentStatus::Pending,
            payment: None,
            gateway_reference: None,
            notes: String::new(),
        }
    }

    pub fn stage(&self) -> SessionStage {
        match (self.status, &self.billing) {
            (PaymentStatus::Pending, _) => SessionStage::Open,
            (PaymentStatus::Paid, None) => SessionStage::AwaitingSettlement,
            (PaymentStatus::Paid, Some(_)) => SessionStage::Settled,
            (PaymentStatus::Cancelled, _) => SessionStage::Cancelled,
        }
    }

    /// `pending -> paid`: records the frozen billing snapshot and the captured
    /// payment. Also completes a row the gateway already marked paid.
    pub fn settle(
        &self,
        billing: SettledBilling,
        payment: CapturedPayment,
    ) -> Result<Self, BillingError> {
        if !self.stage().is_settleable() {
            return Err(self.invalid("settle"));
        }
        let mut next = self.clone();
        next.billing = Some(billing);
        next.payment = Some(payment);
        next.status = PaymentStatus::Paid;
        Ok(next)
    }

    /// `pending -> cancelled`: administrator force-end without billing.
    pub fn force_end(&self, actor: &str, at: DateTime<Utc>) -> Result<Self, BillingError> {
        self.require(PaymentStatus::Pending, "force-end")?;
        let mut next = self.clone();
        next.status = PaymentStatus::Cancelled;
        next.append_note(format!("force-ended by {actor} at {}", at.to_rfc3339()));
        Ok(next)
    }

    /// `paid -> cancelled`: void. Billing fields are kept as history.
    pub fn void(&self, actor: &str, at: DateTime<Utc>) -> Result<Self, BillingError> {
        if self.stage() != SessionStage::Settled {
            return Err(self.invalid("void"));
        }
        let mut next = self.clone();
        next.status = PaymentStatus::Cancelled;
        next.append_note(format!("voided by {actor} at {}", at.to_rfc3339()));
        Ok(next)
    }

    /// Records the webhook's confirmation on a pending session.
    pub fn confirm_push(&self, reference: &str) -> Result<Self, BillingError> {
        self.require(PaymentStatus::Pending, "confirm push for")?;
        let mut next = self.clone();
        next.gateway_reference = Some(reference.to_string());
        Ok(next)
    }

    pub fn customers(&self) -> impl Iterator<Item = CustomerId> {
        std::iter::once(self.primary_customer).chain(self.secondary_customer)
    }

    pub fn mpesa_reference(&self) -> Option<&str> {
        self.payment.as_ref().and_then(|p| p.reference())
    }

    fn require(&self, expected: PaymentStatus, action: &str) -> Result<(), BillingError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &str) -> BillingError {
        BillingError::InvalidTransition(format!(
            "cannot {action} session {} in status {}",
            self.id, self.status
        ))
    }

    fn append_note(&mut self, line: String) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(&line);
    }
}
