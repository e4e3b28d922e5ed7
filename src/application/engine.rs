use super::Warning;
use super::capture::{CaptureProgress, PaymentCapture};
use super::occupancy::StationCoordinator;
use super::push::{PushPaymentFlow, PushSettings};
use super::settlement::{SettlementCoordinator, SettlementDraft, SettlementReport};
use super::timer::{TimerBoard, TimerEvent, TimerSettings};
use super::void::{VoidReport, VoidWorkflow};
use crate::config::BillingConfig;
use crate::domain::events::{BillingEvent, EventBus};
use crate::domain::payment::{CapturedPayment, PaymentInput};
use crate::domain::ports::{
    ClockRef, GatewayRef, LoyaltyLedgerRef, OffersProviderRef, SessionStoreRef, StationStoreRef,
};
use crate::domain::pricing::PricingPolicy;
use crate::domain::session::{
    CustomerId, NewSession, PaymentStatus, Session, SessionId, SessionStage,
};
use crate::domain::staff::Staff;
use crate::domain::station::Station;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// The collaborators the engine runs against.
#[derive(Clone)]
pub struct Ports {
    pub sessions: SessionStoreRef,
    pub stations: StationStoreRef,
    pub ledger: LoyaltyLedgerRef,
    pub gateway: GatewayRef,
    pub offers: OffersProviderRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceEndOutcome {
    Ended,
    AlreadyCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForceEndReport {
    pub session: SessionId,
    pub outcome: ForceEndOutcome,
    pub warnings: Vec<Warning>,
}

/// The main entry point for the desk workflows.
///
/// `LoungeEngine` starts sessions, runs settlement and payment capture,
/// force-ends and voids, and publishes a [`BillingEvent`] for every change so
/// read-models stay current.
#[derive(Clone)]
pub struct LoungeEngine {
    sessions: SessionStoreRef,
    stations: StationStoreRef,
    ledger: LoyaltyLedgerRef,
    config: BillingConfig,
    events: EventBus,
    occupancy: StationCoordinator,
    capture: PaymentCapture,
    settlement: SettlementCoordinator,
    void: VoidWorkflow,
}

impl LoungeEngine {
    /// Creates a new `LoungeEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `ports` - Stores, gateway and offers provider.
    /// * `config` - Billing tunables; rejected if invalid.
    pub fn new(ports: Ports, config: BillingConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();
        let occupancy = StationCoordinator::new(ports.stations.clone(), events.clone());
        let push = PushPaymentFlow::new(
            ports.gateway,
            ports.sessions.clone(),
            PushSettings::from(&config),
        );
        let capture = PaymentCapture::new(push, config.min_reference_len);
        let settlement = SettlementCoordinator::new(
            ports.sessions.clone(),
            ports.ledger.clone(),
            ports.offers,
            occupancy.clone(),
            events.clone(),
            PricingPolicy::from(&config),
        );
        let void = VoidWorkflow::new(ports.sessions.clone(), ports.ledger.clone(), events.clone());

        Ok(Self {
            sessions: ports.sessions,
            stations: ports.stations,
            ledger: ports.ledger,
            config,
            events,
            occupancy,
            capture,
            settlement,
            void,
        })
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.events.subscribe()
    }

    /// Adds a station. An id that is already registered is rejected so its
    /// occupancy is never reset.
    pub async fn register_station(&self, station: Station) -> Result<()> {
        let (id, name, status) = (station.id, station.name.clone(), station.status);
        self.stations.insert(station).await?;
        info!(station = %id, %name, %status, "station registered");
        Ok(())
    }

    /// Validates the request, claims the station and records a pending session.
    pub async fn start_session(&self, request: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let rate = request.validate(self.config.max_rate)?;
        let station = request.station;
        self.occupancy.claim(station).await?;

        let session = Session::open(SessionId::new(), request, rate, now);
        if let Err(e) = self.sessions.insert(session.clone()).await {
            // Give the station back so the failed start leaves no trace.
            if let Err(release) = self.occupancy.release(station).await {
                error!(%station, error = %release, "station left in use after failed start");
            }
            return Err(e);
        }
        info!(
            session = %session.id,
            %station,
            customer = %session.primary_customer,
            mode = %session.mode,
            rate = %session.rate,
            "session started"
        );
        self.events.publish(BillingEvent::SessionStarted {
            session: session.id,
            station,
        });
        Ok(session)
    }

    pub async fn session(&self, id: SessionId) -> Result<Session> {
        self.sessions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("session {id}")))
    }

    pub async fn open_settlement(&self, id: SessionId, now: DateTime<Utc>) -> Result<SettlementDraft> {
        let session = self.session(id).await?;
        self.settlement.open_settlement(&session, now).await
    }

    pub fn begin_payment(
        &self,
        draft: &SettlementDraft,
        input: PaymentInput,
    ) -> Result<CaptureProgress> {
        self.capture
            .begin(draft.session_id(), draft.amount(), input)
    }

    pub async fn commit_settlement(
        &self,
        draft: &SettlementDraft,
        payment: CapturedPayment,
    ) -> Result<SettlementReport> {
        self.settlement.commit_settlement(draft, payment).await
    }

    /// `pending -> cancelled` without billing. Frees the station.
    pub async fn force_end(
        &self,
        id: SessionId,
        staff: &Staff,
        now: DateTime<Utc>,
    ) -> Result<ForceEndReport> {
        staff.require_admin("force-end a session")?;
        let session = self.session(id).await?;
        if session.status == PaymentStatus::Cancelled {
            return Ok(ForceEndReport {
                session: id,
                outcome: ForceEndOutcome::AlreadyCancelled,
                warnings: Vec::new(),
            });
        }

        let next = session.force_end(&staff.name, now)?;
        if self
            .sessions
            .compare_and_set(id, SessionStage::Open, next)
            .await?
            == 0
        {
            let current = self.session(id).await?;
            return match current.status {
                PaymentStatus::Cancelled => Ok(ForceEndReport {
                    session: id,
                    outcome: ForceEndOutcome::AlreadyCancelled,
                    warnings: Vec::new(),
                }),
                status => Err(BillingError::InvalidTransition(format!(
                    "cannot force-end session {id} in status {status}"
                ))),
            };
        }
        info!(session = %id, actor = %staff.name, "session force-ended");
        self.events
            .publish(BillingEvent::SessionForceEnded { session: id });

        let mut warnings = Vec::new();
        if let Err(e) = self.occupancy.release(session.station).await {
            warn!(session = %id, station = %session.station, error = %e, "station not released after force-end");
            warnings.push(Warning::StationNotReleased {
                station: session.station,
                reason: e.to_string(),
            });
        }
        Ok(ForceEndReport {
            session: id,
            outcome: ForceEndOutcome::Ended,
            warnings,
        })
    }

    pub async fn void_session(
        &self,
        id: SessionId,
        staff: &Staff,
        now: DateTime<Utc>,
    ) -> Result<VoidReport> {
        self.void.void_session(id, staff, now).await
    }

    /// The customer's loyalty balance as summed by the ledger.
    pub async fn balance(&self, customer: CustomerId) -> Result<i64> {
        self.ledger.balance(customer).await
    }

    /// A board of session timers driven by this engine's settings.
    pub fn timer_board(&self, clock: ClockRef, tx: mpsc::UnboundedSender<TimerEvent>) -> TimerBoard {
        TimerBoard::new(
            self.sessions.clone(),
            clock,
            TimerSettings::from(&self.config),
            tx,
        )
    }
}
