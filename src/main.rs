use clap::{Parser, Subcommand, ValueEnum};
use lounge_billing::application::Warning;
use lounge_billing::application::engine::{LoungeEngine, Ports};
use lounge_billing::config::BillingConfig;
use lounge_billing::domain::money::Rate;
use lounge_billing::domain::pricing::{self, PricingPolicy};
use lounge_billing::domain::session::{BillingMode, CustomerId, SessionId};
use lounge_billing::domain::station::Station;
use lounge_billing::error::{BillingError, Result as BillingResult};
use lounge_billing::infrastructure::in_memory::{
    GatewayScript, InMemoryLedger, InMemoryOffers, InMemorySessionStore, InMemoryStationStore,
    ScriptedGateway,
};
use lounge_billing::interfaces::csv::operation_reader::{Operation, OperationReader};
use lounge_billing::interfaces::csv::session_writer::SessionWriter;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Price a session of the given length without touching any store
    Quote {
        #[arg(long, value_enum)]
        mode: ModeArg,
        #[arg(long)]
        rate: Decimal,
        #[arg(long)]
        minutes: i64,
        /// Billing configuration JSON (optional)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a CSV of desk operations through the engine and print the result
    Replay {
        /// Input operations CSV file
        input: PathBuf,
        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Billing configuration JSON (optional)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    PerHour,
    PerGame,
}

impl From<ModeArg> for BillingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::PerHour => BillingMode::PerHour,
            ModeArg::PerGame => BillingMode::PerGame,
        }
    }
}

#[derive(Serialize)]
struct QuoteRow {
    mode: String,
    duration_minutes: i64,
    billable_units: i64,
    amount: String,
    points: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Quote {
            mode,
            rate,
            minutes,
            config,
        } => quote(mode.into(), rate, minutes, &load_config(config.as_deref())?),
        Command::Replay {
            input,
            db_path,
            config,
        } => replay(&input, db_path.as_deref(), load_config(config.as_deref())?).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<BillingConfig> {
    match path {
        Some(path) => BillingConfig::from_path(path).into_diagnostic(),
        None => Ok(BillingConfig::default()),
    }
}

fn quote(mode: BillingMode, rate: Decimal, minutes: i64, config: &BillingConfig) -> Result<()> {
    let rate = Rate::new(rate, config.max_rate).into_diagnostic()?;
    let quote = pricing::quote_minutes(mode, rate, minutes, PricingPolicy::from(config));

    let mut writer = csv::Writer::from_writer(io::stdout().lock());
    writer
        .serialize(QuoteRow {
            mode: mode.to_string(),
            duration_minutes: quote.duration_minutes,
            billable_units: quote.billable_units,
            amount: quote.amount.to_string(),
            points: quote.points,
        })
        .into_diagnostic()?;
    writer.flush().into_diagnostic()?;
    Ok(())
}

fn in_memory_ports() -> Ports {
    let sessions = Arc::new(InMemorySessionStore::new());
    Ports {
        sessions: sessions.clone(),
        stations: Arc::new(InMemoryStationStore::new()),
        ledger: Arc::new(InMemoryLedger::new()),
        gateway: Arc::new(replay_gateway(sessions)),
        offers: Arc::new(InMemoryOffers::new()),
    }
}

fn replay_gateway(sessions: lounge_billing::domain::ports::SessionStoreRef) -> ScriptedGateway {
    ScriptedGateway::new(
        GatewayScript::Reject {
            reason: "push payments are not available in replay".to_string(),
        },
        sessions,
    )
}

#[cfg(feature = "storage-rocksdb")]
fn persistent_ports(path: &Path) -> Result<Ports> {
    use lounge_billing::infrastructure::rocksdb::RocksDBStore;

    let store = Arc::new(RocksDBStore::open(path).into_diagnostic()?);
    Ok(Ports {
        sessions: store.clone(),
        stations: store.clone(),
        ledger: store.clone(),
        gateway: Arc::new(replay_gateway(store)),
        offers: Arc::new(InMemoryOffers::new()),
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn persistent_ports(_path: &Path) -> Result<Ports> {
    eprintln!(
        "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
    );
    Ok(in_memory_ports())
}

/// Tracks the sessions a replay file refers to by label.
#[derive(Default)]
struct Desk {
    order: Vec<String>,
    sessions: HashMap<String, SessionId>,
    customers: BTreeSet<CustomerId>,
}

impl Desk {
    fn lookup(&self, label: &str) -> BillingResult<SessionId> {
        self.sessions
            .get(label)
            .copied()
            .ok_or_else(|| BillingError::NotFound(format!("session {label}")))
    }

    async fn apply(&mut self, engine: &LoungeEngine, op: Operation) -> BillingResult<Vec<Warning>> {
        match op {
            Operation::RegisterStation { station, name } => {
                engine.register_station(Station::new(station, name)).await?;
                Ok(Vec::new())
            }
            Operation::Start {
                session,
                request,
                at,
            } => {
                if self.sessions.contains_key(&session) {
                    return Err(BillingError::ValidationError(format!(
                        "session {session} was already started"
                    )));
                }
                let started = engine.start_session(request, at).await?;
                self.customers.extend(started.customers());
                self.sessions.insert(session.clone(), started.id);
                self.order.push(session);
                Ok(Vec::new())
            }
            Operation::Settle {
                session,
                payment,
                at,
            } => {
                let id = self.lookup(&session)?;
                let draft = engine.open_settlement(id, at).await?;
                let captured = engine
                    .begin_payment(&draft, payment)?
                    .captured()
                    .ok_or_else(|| {
                        BillingError::GatewayError("payment was not captured".to_string())
                    })?;
                Ok(engine.commit_settlement(&draft, captured).await?.warnings)
            }
            Operation::ForceEnd { session, staff, at } => {
                let id = self.lookup(&session)?;
                Ok(engine.force_end(id, &staff, at).await?.warnings)
            }
            Operation::Void { session, staff, at } => {
                let id = self.lookup(&session)?;
                Ok(engine.void_session(id, &staff, at).await?.warnings)
            }
        }
    }
}

async fn replay(input: &Path, db_path: Option<&Path>, config: BillingConfig) -> Result<()> {
    let ports = match db_path {
        Some(path) => persistent_ports(path)?,
        None => in_memory_ports(),
    };
    let engine = LoungeEngine::new(ports, config).into_diagnostic()?;

    let file = File::open(input).into_diagnostic()?;
    let reader = OperationReader::new(file);
    let mut desk = Desk::default();
    for op_result in reader.operations() {
        match op_result {
            Ok(op) => match desk.apply(&engine, op).await {
                Ok(warnings) => {
                    for warning in warnings {
                        eprintln!("Warning: {warning}");
                    }
                }
                Err(e) => eprintln!("Error processing operation: {e}"),
            },
            Err(e) => eprintln!("Error reading operation: {e}"),
        }
    }

    let mut sessions = Vec::with_capacity(desk.order.len());
    for label in &desk.order {
        let id = desk.lookup(label).into_diagnostic()?;
        sessions.push((label.as_str(), engine.session(id).await.into_diagnostic()?));
    }
    let mut balances = Vec::with_capacity(desk.customers.len());
    for customer in &desk.customers {
        balances.push((*customer, engine.balance(*customer).await.into_diagnostic()?));
    }

    let stdout = io::stdout();
    let mut writer = SessionWriter::new(stdout.lock());
    writer
        .write_sessions(sessions.iter().map(|(label, session)| (*label, session)))
        .into_diagnostic()?;
    writer.write_balances(balances).into_diagnostic()?;

    Ok(())
}
