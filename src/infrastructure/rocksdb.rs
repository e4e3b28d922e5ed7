use crate::domain::loyalty::LoyaltyTransaction;
use crate::domain::ports::{LoyaltyLedger, SessionStore, StationStore};
use crate::domain::session::{
    CustomerId, PaymentStatus, Session, SessionId, SessionStage, StationId,
};
use crate::domain::station::{Station, StationStatus};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for session rows, keyed by session id.
pub const CF_SESSIONS: &str = "sessions";
/// Column Family for stations, keyed by big-endian station id.
pub const CF_STATIONS: &str = "stations";
/// Column Family for the append-only loyalty ledger, keyed by entry id.
pub const CF_LOYALTY: &str = "loyalty";

/// A persistent store implementation using RocksDB.
///
/// Sessions, stations and loyalty entries live in separate Column Families
/// as JSON values. Conditional updates (`compare_and_set`, `transition`) take
/// an internal write lock so the read-check-write is atomic across clones.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_SESSIONS, CF_STATIONS, CF_LOYALTY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| BillingError::PersistenceError(format!("column family {name} not found")))
    }

    fn put<T: Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(family)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: &str) -> Result<Vec<T>> {
        let cf = self.cf(family)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }
}

fn session_key(id: SessionId) -> [u8; 16] {
    *id.0.as_bytes()
}

fn station_key(id: StationId) -> [u8; 4] {
    id.0.to_be_bytes()
}

#[async_trait]
impl SessionStore for RocksDBStore {
    async fn insert(&self, session: Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = session_key(session.id);
        if self.read::<Session>(CF_SESSIONS, &key)?.is_some() {
            return Err(BillingError::PersistenceError(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.put(CF_SESSIONS, &key, &session)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>> {
        self.read(CF_SESSIONS, &session_key(id))
    }

    async fn compare_and_set(
        &self,
        id: SessionId,
        expected: SessionStage,
        next: Session,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let key = session_key(id);
        match self.read::<Session>(CF_SESSIONS, &key)? {
            Some(current) if current.stage() == expected => {
                self.put(CF_SESSIONS, &key, &next)?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list_pending(&self) -> Result<Vec<Session>> {
        let sessions: Vec<Session> = self.scan(CF_SESSIONS)?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.status == PaymentStatus::Pending)
            .collect())
    }
}

#[async_trait]
impl StationStore for RocksDBStore {
    async fn insert(&self, station: Station) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = station_key(station.id);
        if self.read::<Station>(CF_STATIONS, &key)?.is_some() {
            return Err(BillingError::PersistenceError(format!(
                "station {} already exists",
                station.id
            )));
        }
        self.put(CF_STATIONS, &key, &station)
    }

    async fn get(&self, id: StationId) -> Result<Option<Station>> {
        self.read(CF_STATIONS, &station_key(id))
    }

    async fn transition(
        &self,
        id: StationId,
        from: Option<StationStatus>,
        to: StationStatus,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let key = station_key(id);
        match self.read::<Station>(CF_STATIONS, &key)? {
            Some(mut station) if from.is_none_or(|f| f == station.status) => {
                station.status = to;
                self.put(CF_STATIONS, &key, &station)?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl LoyaltyLedger for RocksDBStore {
    async fn append(&self, entry: LoyaltyTransaction) -> Result<()> {
        self.put(CF_LOYALTY, entry.id.as_bytes(), &entry)
    }

    async fn entries_for_session(&self, session: SessionId) -> Result<Vec<LoyaltyTransaction>> {
        let entries: Vec<LoyaltyTransaction> = self.scan(CF_LOYALTY)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.session == Some(session))
            .collect())
    }

    async fn balance(&self, customer: CustomerId) -> Result<i64> {
        let entries: Vec<LoyaltyTransaction> = self.scan(CF_LOYALTY)?;
        Ok(entries
            .iter()
            .filter(|e| e.customer == customer)
            .map(|e| e.points)
            .sum())
    }
}
