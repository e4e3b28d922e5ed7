use super::loyalty::LoyaltyTransaction;
use super::money::Money;
use super::payment::PhoneNumber;
use super::session::{CustomerId, Session, SessionId, SessionStage, StationId};
use super::station::{Station, StationStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Durable storage for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<()>;
    async fn get(&self, id: SessionId) -> Result<Option<Session>>;
    /// Replaces the stored row with `next` only if it is still at stage
    /// `expected`. Returns the number of rows affected (0 or 1).
    async fn compare_and_set(
        &self,
        id: SessionId,
        expected: SessionStage,
        next: Session,
    ) -> Result<u64>;
    async fn list_pending(&self) -> Result<Vec<Session>>;
}

/// Durable storage for stations.
#[async_trait]
pub trait StationStore: Send + Sync {
    async fn insert(&self, station: Station) -> Result<()>;
    async fn get(&self, id: StationId) -> Result<Option<Station>>;
    /// Sets the status to `to` when the current status equals `from`, or
    /// unconditionally when `from` is `None`. Returns rows affected.
    async fn transition(
        &self,
        id: StationId,
        from: Option<StationStatus>,
        to: StationStatus,
    ) -> Result<u64>;
}

/// The append-only loyalty ledger. Balances are derived by the ledger itself.
#[async_trait]
pub trait LoyaltyLedger: Send + Sync {
    async fn append(&self, entry: LoyaltyTransaction) -> Result<()>;
    async fn entries_for_session(&self, session: SessionId) -> Result<Vec<LoyaltyTransaction>>;
    async fn balance(&self, customer: CustomerId) -> Result<i64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub amount: Money,
    pub phone: PhoneNumber,
    pub session: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted { checkout_id: String },
    Rejected { reason: String },
}

/// Mobile-money gateway. Completion is observed by polling the session row,
/// the gateway writes it back through a webhook outside this crate.
#[async_trait]
pub trait MobileMoneyGateway: Send + Sync {
    async fn initiate_push(&self, request: PushRequest) -> Result<PushOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub description: String,
    pub expiry: DateTime<Utc>,
}

/// Read-only, advisory promotional offers.
#[async_trait]
pub trait OffersProvider: Send + Sync {
    async fn list_active_offers(&self, customer: CustomerId) -> Result<Vec<Offer>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SessionStoreRef = Arc<dyn SessionStore>;
pub type StationStoreRef = Arc<dyn StationStore>;
pub type LoyaltyLedgerRef = Arc<dyn LoyaltyLedger>;
pub type GatewayRef = Arc<dyn MobileMoneyGateway>;
pub type OffersProviderRef = Arc<dyn OffersProvider>;
pub type ClockRef = Arc<dyn Clock>;
