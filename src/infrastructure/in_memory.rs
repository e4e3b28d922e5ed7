use crate::domain::loyalty::LoyaltyTransaction;
use crate::domain::ports::{
    Clock, LoyaltyLedger, MobileMoneyGateway, Offer, OffersProvider, PushOutcome, PushRequest,
    SessionStore, SessionStoreRef, StationStore,
};
use crate::domain::session::{
    CustomerId, PaymentStatus, Session, SessionId, SessionStage, StationId,
};
use crate::domain::station::{Station, StationStatus};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for session rows.
///
/// Uses `Arc<RwLock<HashMap<SessionId, Session>>>`; the write lock makes
/// `compare_and_set` atomic the way a conditional `UPDATE ... WHERE` is.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    reads: Arc<AtomicUsize>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served; lets tests observe poll traffic.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn all(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut rows: Vec<Session> = sessions.values().cloned().collect();
        rows.sort_by_key(|s| (s.start_time, s.id));
        rows
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(BillingError::PersistenceError(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        id: SessionId,
        expected: SessionStage,
        next: Session,
    ) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(current) if current.stage() == expected => {
                *current = next;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list_pending(&self) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status == PaymentStatus::Pending)
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory store for stations.
#[derive(Default, Clone)]
pub struct InMemoryStationStore {
    stations: Arc<RwLock<HashMap<StationId, Station>>>,
}

impl InMemoryStationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Station> {
        let stations = self.stations.read().await;
        let mut rows: Vec<Station> = stations.values().cloned().collect();
        rows.sort_by_key(|s| s.id);
        rows
    }
}

#[async_trait]
impl StationStore for InMemoryStationStore {
    async fn insert(&self, station: Station) -> Result<()> {
        let mut stations = self.stations.write().await;
        if stations.contains_key(&station.id) {
            return Err(BillingError::PersistenceError(format!(
                "station {} already exists",
                station.id
            )));
        }
        stations.insert(station.id, station);
        Ok(())
    }

    async fn get(&self, id: StationId) -> Result<Option<Station>> {
        let stations = self.stations.read().await;
        Ok(stations.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: StationId,
        from: Option<StationStatus>,
        to: StationStatus,
    ) -> Result<u64> {
        let mut stations = self.stations.write().await;
        match stations.get_mut(&id) {
            Some(station) if from.is_none_or(|f| f == station.status) => {
                station.status = to;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

/// In-memory loyalty ledger. The balance is the running sum of entries,
/// standing in for the store's summation trigger.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    entries: Arc<RwLock<Vec<LoyaltyTransaction>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<LoyaltyTransaction> {
        self.entries.read().await.clone()
    }

    /// Customers with at least one entry, with their balances, ordered by id.
    pub async fn balances(&self) -> Vec<(CustomerId, i64)> {
        let entries = self.entries.read().await;
        let mut totals: HashMap<CustomerId, i64> = HashMap::new();
        for entry in entries.iter() {
            *totals.entry(entry.customer).or_default() += entry.points;
        }
        let mut rows: Vec<_> = totals.into_iter().collect();
        rows.sort_by_key(|(customer, _)| *customer);
        rows
    }
}

#[async_trait]
impl LoyaltyLedger for InMemoryLedger {
    async fn append(&self, entry: LoyaltyTransaction) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries_for_session(&self, session: SessionId) -> Result<Vec<LoyaltyTransaction>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.session == Some(session))
            .cloned()
            .collect())
    }

    async fn balance(&self, customer: CustomerId) -> Result<i64> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.customer == customer)
            .map(|e| e.points)
            .sum())
    }
}

/// Offers keyed by customer.
#[derive(Default, Clone)]
pub struct InMemoryOffers {
    offers: Arc<RwLock<HashMap<CustomerId, Vec<Offer>>>>,
}

impl InMemoryOffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, customer: CustomerId, offer: Offer) {
        self.offers.write().await.entry(customer).or_default().push(offer);
    }
}

#[async_trait]
impl OffersProvider for InMemoryOffers {
    async fn list_active_offers(&self, customer: CustomerId) -> Result<Vec<Offer>> {
        let offers = self.offers.read().await;
        Ok(offers.get(&customer).cloned().unwrap_or_default())
    }
}

/// How a [`ScriptedGateway`] answers push requests.
#[derive(Debug, Clone)]
pub enum GatewayScript {
    /// Accept and, after `after`, write `reference` onto the session the way
    /// the payment webhook does.
    Confirm { after: Duration, reference: String },
    /// Accept but never confirm.
    Silent,
    Reject { reason: String },
}

/// Gateway double driven by a script, used by tests and local demos.
#[derive(Clone)]
pub struct ScriptedGateway {
    script: Arc<Mutex<GatewayScript>>,
    sessions: SessionStoreRef,
    requests: Arc<Mutex<Vec<PushRequest>>>,
}

impl ScriptedGateway {
    pub fn new(script: GatewayScript, sessions: SessionStoreRef) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            sessions,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_script(&self, script: GatewayScript) {
        if let Ok(mut current) = self.script.lock() {
            *current = script;
        }
    }

    pub fn requests(&self) -> Vec<PushRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MobileMoneyGateway for ScriptedGateway {
    async fn initiate_push(&self, request: PushRequest) -> Result<PushOutcome> {
        let script = self
            .script
            .lock()
            .map(|s| s.clone())
            .map_err(|_| BillingError::GatewayError("gateway script poisoned".to_string()))?;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        match script {
            GatewayScript::Reject { reason } => Ok(PushOutcome::Rejected { reason }),
            GatewayScript::Silent => Ok(PushOutcome::Accepted {
                checkout_id: format!("ws_CO_{}", request.session),
            }),
            GatewayScript::Confirm { after, reference } => {
                let sessions = self.sessions.clone();
                let id = request.session;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Ok(Some(session)) = sessions.get(id).await
                        && let Ok(next) = session.confirm_push(&reference)
                    {
                        let _ = sessions
                            .compare_and_set(id, SessionStage::Open, next)
                            .await;
                    }
                });
                Ok(PushOutcome::Accepted {
                    checkout_id: format!("ws_CO_{id}"),
                })
            }
        }
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}
