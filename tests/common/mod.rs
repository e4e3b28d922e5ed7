#![allow(dead_code)]

use lounge_billing::application::engine::{LoungeEngine, Ports};
use lounge_billing::config::BillingConfig;
use lounge_billing::infrastructure::in_memory::{
    GatewayScript, InMemoryLedger, InMemoryOffers, InMemorySessionStore, InMemoryStationStore,
    ScriptedGateway,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const HEADER: &str =
    "op,session,station,name,customer,secondary,game,mode,rate,at,payment,reference,actor,role";

/// Writes an operations file with the standard header followed by `rows`.
pub fn ops_file(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file
}

pub struct Lounge {
    pub engine: LoungeEngine,
    pub sessions: InMemorySessionStore,
    pub stations: InMemoryStationStore,
    pub ledger: InMemoryLedger,
    pub gateway: ScriptedGateway,
}

/// An engine over fresh in-memory stores and a scripted gateway.
pub fn lounge(script: GatewayScript) -> Lounge {
    let sessions = InMemorySessionStore::new();
    let stations = InMemoryStationStore::new();
    let ledger = InMemoryLedger::new();
    let gateway = ScriptedGateway::new(script, Arc::new(sessions.clone()));
    let engine = LoungeEngine::new(
        Ports {
            sessions: Arc::new(sessions.clone()),
            stations: Arc::new(stations.clone()),
            ledger: Arc::new(ledger.clone()),
            gateway: Arc::new(gateway.clone()),
            offers: Arc::new(InMemoryOffers::new()),
        },
        BillingConfig::default(),
    )
    .unwrap();
    Lounge {
        engine,
        sessions,
        stations,
        ledger,
        gateway,
    }
}
