//! Settlement: freeze the bill, capture payment, persist, free the station,
//! award points.

use super::Warning;
use super::occupancy::StationCoordinator;
use crate::domain::events::{BillingEvent, EventBus};
use crate::domain::loyalty::LoyaltyTransaction;
use crate::domain::money::Money;
use crate::domain::payment::CapturedPayment;
use crate::domain::ports::{LoyaltyLedgerRef, Offer, OffersProviderRef, SessionStoreRef};
use crate::domain::pricing::{self, BillingQuote, PricingPolicy};
use crate::domain::session::{
    CustomerId, PaymentStatus, Session, SessionId, SessionStage, SettledBilling,
};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Who is shown as paying for a two-player session.
///
/// Display and receipt only: the persisted charge and the single earn entry
/// always belong to the session's primary customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Apportionment {
    #[default]
    PrimaryPaysAll,
    SecondaryPaysAll,
    Split,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartyShare {
    pub customer: CustomerId,
    pub amount: Money,
    pub points: u32,
}

/// A frozen bill held by the settlement dialog. Nothing is persisted until
/// [`SettlementCoordinator::commit_settlement`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementDraft {
    pub session: Session,
    pub end_time: DateTime<Utc>,
    pub quote: BillingQuote,
    pub offers: Vec<Offer>,
    apportionment: Apportionment,
}

impl SettlementDraft {
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn amount(&self) -> Money {
        self.quote.amount
    }

    pub fn apportionment(&self) -> Apportionment {
        self.apportionment
    }

    pub fn choose_apportionment(&mut self, apportionment: Apportionment) -> Result<()> {
        if apportionment != Apportionment::PrimaryPaysAll
            && self.session.secondary_customer.is_none()
        {
            return Err(BillingError::ValidationError(
                "Apportionment needs a second player on the session".to_string(),
            ));
        }
        self.apportionment = apportionment;
        Ok(())
    }

    /// Per-player amounts and points as shown on screen and on the receipt.
    pub fn shares(&self) -> Vec<PartyShare> {
        let amount = self.quote.amount;
        let points = self.quote.points;
        let primary = self.session.primary_customer;
        match (self.apportionment, self.session.secondary_customer) {
            (Apportionment::SecondaryPaysAll, Some(secondary)) => vec![PartyShare {
                customer: secondary,
                amount,
                points,
            }],
            (Apportionment::Split, Some(secondary)) => vec![
                PartyShare {
                    customer: primary,
                    amount: amount / 2,
                    points: points / 2,
                },
                PartyShare {
                    customer: secondary,
                    amount: amount / 2,
                    points: points / 2,
                },
            ],
            _ => vec![PartyShare {
                customer: primary,
                amount,
                points,
            }],
        }
    }

    pub fn billing(&self) -> SettledBilling {
        self.quote.into_billing(self.end_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled,
    /// The session was already settled or cancelled; nothing was changed.
    AlreadyFinal(PaymentStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub session: SessionId,
    pub outcome: SettlementOutcome,
    pub earned: Option<LoyaltyTransaction>,
    pub warnings: Vec<Warning>,
}

#[derive(Clone)]
pub struct SettlementCoordinator {
    sessions: SessionStoreRef,
    ledger: LoyaltyLedgerRef,
    offers: OffersProviderRef,
    stations: StationCoordinator,
    events: EventBus,
    policy: PricingPolicy,
}

impl SettlementCoordinator {
    pub fn new(
        sessions: SessionStoreRef,
        ledger: LoyaltyLedgerRef,
        offers: OffersProviderRef,
        stations: StationCoordinator,
        events: EventBus,
        policy: PricingPolicy,
    ) -> Self {
        Self {
            sessions,
            ledger,
            offers,
            stations,
            events,
            policy,
        }
    }

    /// Freezes the bill for `session` at `now` and gathers advisory offers.
    pub async fn open_settlement(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<SettlementDraft> {
        if !session.stage().is_settleable() {
            return Err(BillingError::InvalidTransition(format!(
                "session {} is already {}",
                session.id, session.status
            )));
        }
        let quote = pricing::quote(
            session.mode,
            session.rate,
            session.start_time,
            now,
            self.policy,
        );
        let offers = match self
            .offers
            .list_active_offers(session.primary_customer)
            .await
        {
            Ok(offers) => offers.into_iter().filter(|o| o.expiry > now).collect(),
            Err(e) => {
                warn!(session = %session.id, error = %e, "could not load offers");
                Vec::new()
            }
        };

        Ok(SettlementDraft {
            session: session.clone(),
            end_time: now,
            quote,
            offers,
            apportionment: Apportionment::default(),
        })
    }

    /// Persists a settled session after a successful capture.
    ///
    /// A row the gateway already marked paid is completed here too: it still
    /// lacks billing, a free station and the earn entry.
    ///
    /// The session update is the only step whose failure aborts. Station
    /// release and the loyalty append run concurrently afterwards and degrade
    /// to warnings.
    pub async fn commit_settlement(
        &self,
        draft: &SettlementDraft,
        payment: CapturedPayment,
    ) -> Result<SettlementReport> {
        let id = draft.session_id();
        let billing = draft.billing();
        let next = loop {
            let current = self
                .sessions
                .get(id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("session {id}")))?;
            let stage = current.stage();
            if !stage.is_settleable() {
                return Ok(Self::already_final(id, current.status));
            }

            let next = current.settle(billing.clone(), payment.clone())?;
            if self
                .sessions
                .compare_and_set(id, stage, next.clone())
                .await?
                == 1
            {
                break next;
            }
            // The row moved between read and write; look again.
        };
        info!(
            session = %id,
            amount = %billing.amount_charged,
            points = billing.points_earned,
            method = ?next.payment.as_ref().map(|p| p.method()),
            "session settled"
        );
        self.events.publish(BillingEvent::SessionSettled {
            session: id,
            amount: billing.amount_charged,
            points: billing.points_earned,
        });

        let customer = next.primary_customer;
        let earn = (billing.points_earned > 0).then(|| {
            LoyaltyTransaction::earn(customer, id, billing.points_earned, billing.end_time)
        });
        let (released, appended) = tokio::join!(self.stations.release(next.station), async {
            match &earn {
                Some(entry) => self.ledger.append(entry.clone()).await,
                None => Ok(()),
            }
        });

        let mut warnings = Vec::new();
        if let Err(e) = released {
            warn!(session = %id, station = %next.station, error = %e, "station not released after settlement");
            warnings.push(Warning::StationNotReleased {
                station: next.station,
                reason: e.to_string(),
            });
        }
        let earned = match appended {
            Ok(()) => {
                if let Some(entry) = &earn {
                    self.events.publish(BillingEvent::PointsChanged {
                        customer,
                        delta: entry.points,
                    });
                }
                earn
            }
            Err(e) => {
                warn!(session = %id, %customer, error = %e, "loyalty points not recorded");
                warnings.push(Warning::PointsNotRecorded {
                    customer,
                    points: i64::from(billing.points_earned),
                    reason: e.to_string(),
                });
                None
            }
        };

        Ok(SettlementReport {
            session: id,
            outcome: SettlementOutcome::Settled,
            earned,
            warnings,
        })
    }

    fn already_final(id: SessionId, status: PaymentStatus) -> SettlementReport {
        info!(session = %id, %status, "settlement skipped, session already final");
        SettlementReport {
            session: id,
            outcome: SettlementOutcome::AlreadyFinal(status),
            earned: None,
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{FailingLedger, FailingStationStore};
    use crate::domain::payment::PhoneNumber;
    use crate::domain::ports::{LoyaltyLedger, SessionStore, StationStore};
    use crate::domain::session::tests::{at, pending_session};
    use crate::domain::session::{BillingMode, StationId};
    use crate::domain::station::{Station, StationStatus};
    use crate::infrastructure::in_memory::{
        InMemoryLedger, InMemoryOffers, InMemorySessionStore, InMemoryStationStore,
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        coordinator: SettlementCoordinator,
        sessions: InMemorySessionStore,
        stations: InMemoryStationStore,
        ledger: InMemoryLedger,
        offers: InMemoryOffers,
    }

    async fn fixture_with(
        stations: Arc<dyn StationStore>,
        ledger: Arc<dyn LoyaltyLedger>,
    ) -> (SettlementCoordinator, InMemorySessionStore, InMemoryOffers) {
        let sessions = InMemorySessionStore::new();
        let offers = InMemoryOffers::new();
        let events = EventBus::default();
        let coordinator = SettlementCoordinator::new(
            Arc::new(sessions.clone()),
            ledger,
            Arc::new(offers.clone()),
            StationCoordinator::new(stations, events.clone()),
            events,
            PricingPolicy {
                points_per_currency_unit: dec!(0.1),
                block_minutes: 60,
            },
        );
        (coordinator, sessions, offers)
    }

    async fn fixture() -> Fixture {
        let stations = InMemoryStationStore::new();
        let ledger = InMemoryLedger::new();
        let (coordinator, sessions, offers) =
            fixture_with(Arc::new(stations.clone()), Arc::new(ledger.clone())).await;
        Fixture {
            coordinator,
            sessions,
            stations,
            ledger,
            offers,
        }
    }

    async fn seed(sessions: &InMemorySessionStore, stations: &dyn StationStore) -> Session {
        let session = pending_session(BillingMode::PerHour, dec!(200));
        let mut station = Station::new(session.station, "PS5-4");
        station.status = StationStatus::InUse;
        stations.insert(station).await.unwrap();
        sessions.insert(session.clone()).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_open_settlement_freezes_bill_and_filters_offers() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        f.offers
            .add(
                session.primary_customer,
                Offer {
                    description: "Free hour on Friday".to_string(),
                    expiry: at(23, 0),
                },
            )
            .await;
        f.offers
            .add(
                session.primary_customer,
                Offer {
                    description: "Expired promo".to_string(),
                    expiry: at(9, 0),
                },
            )
            .await;

        let draft = f.coordinator.open_settlement(&session, at(10, 42)).await.unwrap();
        assert_eq!(draft.quote.duration_minutes, 42);
        assert_eq!(draft.amount(), Money::new(dec!(200)).unwrap());
        assert_eq!(draft.quote.points, 20);
        assert_eq!(draft.offers.len(), 1);

        let stored = f.sessions.get(session.id).await.unwrap().unwrap();
        assert!(stored.billing.is_none());
    }

    #[tokio::test]
    async fn test_commit_persists_frees_station_and_awards_points() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        let draft = f.coordinator.open_settlement(&session, at(11, 10)).await.unwrap();

        let report = f
            .coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();

        assert_eq!(report.outcome, SettlementOutcome::Settled);
        assert!(report.warnings.is_empty());
        let stored = f.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
        let billing = stored.billing.unwrap();
        assert_eq!(billing.duration_minutes, 70);
        assert_eq!(billing.amount_charged, Money::new(dec!(400)).unwrap());
        assert_eq!(billing.points_earned, 40);
        assert_eq!(
            f.stations.get(session.station).await.unwrap().unwrap().status,
            StationStatus::Available
        );
        assert_eq!(f.ledger.balance(session.primary_customer).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_second_commit_is_a_no_op() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        let draft = f.coordinator.open_settlement(&session, at(10, 42)).await.unwrap();

        f.coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();
        let again = f
            .coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();

        assert_eq!(
            again.outcome,
            SettlementOutcome::AlreadyFinal(PaymentStatus::Paid)
        );
        assert_eq!(f.ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_completes_row_the_gateway_marked_paid() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        let draft = f.coordinator.open_settlement(&session, at(10, 42)).await.unwrap();

        let mut paid = session.clone();
        paid.status = PaymentStatus::Paid;
        paid.gateway_reference = Some("QHK3X9A1BC".to_string());
        f.sessions
            .compare_and_set(session.id, SessionStage::Open, paid)
            .await
            .unwrap();

        let report = f
            .coordinator
            .commit_settlement(
                &draft,
                CapturedPayment::MobileMoneyPush {
                    phone: PhoneNumber::parse("0712345678").unwrap(),
                    reference: "QHK3X9A1BC".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, SettlementOutcome::Settled);
        let stored = f.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.stage(), SessionStage::Settled);
        assert_eq!(stored.mpesa_reference(), Some("QHK3X9A1BC"));
        assert_eq!(
            f.stations.get(session.station).await.unwrap().unwrap().status,
            StationStatus::Available
        );
        assert_eq!(f.ledger.balance(session.primary_customer).await.unwrap(), 20);

        let again = f
            .coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();
        assert_eq!(
            again.outcome,
            SettlementOutcome::AlreadyFinal(PaymentStatus::Paid)
        );
        assert_eq!(f.ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_settlement_rejects_terminal_session() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        let ended = session.force_end("amina", at(10, 5)).unwrap();
        assert!(matches!(
            f.coordinator.open_settlement(&ended, at(10, 6)).await,
            Err(BillingError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_station_failure_degrades_to_warning() {
        let ledger = InMemoryLedger::new();
        let stations = FailingStationStore::default();
        let (coordinator, sessions, _) =
            fixture_with(Arc::new(stations.clone()), Arc::new(ledger.clone())).await;
        let session = pending_session(BillingMode::PerHour, dec!(200));
        sessions.insert(session.clone()).await.unwrap();

        let draft = coordinator.open_settlement(&session, at(10, 42)).await.unwrap();
        let report = coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();

        assert_eq!(report.outcome, SettlementOutcome::Settled);
        assert!(matches!(
            report.warnings.as_slice(),
            [Warning::StationNotReleased { .. }]
        ));
        assert_eq!(ledger.balance(session.primary_customer).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_ledger_failure_keeps_payment() {
        let stations = InMemoryStationStore::new();
        let (coordinator, sessions, _) =
            fixture_with(Arc::new(stations.clone()), Arc::new(FailingLedger)).await;
        let session = seed(&sessions, &stations).await;

        let draft = coordinator.open_settlement(&session, at(10, 42)).await.unwrap();
        let report = coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();

        assert!(report.earned.is_none());
        assert!(matches!(
            report.warnings.as_slice(),
            [Warning::PointsNotRecorded { points: 20, .. }]
        ));
        let stored = sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_zero_points_skips_ledger() {
        let f = fixture().await;
        let mut session = pending_session(BillingMode::PerGame, dec!(5));
        session.station = StationId(8);
        f.stations.insert(Station::new(StationId(8), "PC-8")).await.unwrap();
        f.sessions.insert(session.clone()).await.unwrap();

        let draft = f.coordinator.open_settlement(&session, at(10, 30)).await.unwrap();
        let report = f
            .coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();
        assert!(report.earned.is_none());
        assert!(f.ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_split_apportionment_is_display_only() {
        let f = fixture().await;
        let mut session = seed(&f.sessions, &f.stations).await;
        session.secondary_customer = Some(CustomerId(2));
        f.sessions
            .compare_and_set(session.id, SessionStage::Open, session.clone())
            .await
            .unwrap();

        let mut draft = f.coordinator.open_settlement(&session, at(10, 42)).await.unwrap();
        draft.choose_apportionment(Apportionment::Split).unwrap();
        let shares = draft.shares();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].amount, Money::new(dec!(100)).unwrap());
        assert_eq!(shares[1].points, 10);

        f.coordinator
            .commit_settlement(&draft, CapturedPayment::Cash)
            .await
            .unwrap();
        let stored = f.sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(
            stored.billing.unwrap().amount_charged,
            Money::new(dec!(200)).unwrap()
        );
        assert_eq!(f.ledger.balance(CustomerId(1)).await.unwrap(), 20);
        assert_eq!(f.ledger.balance(CustomerId(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apportionment_requires_second_player() {
        let f = fixture().await;
        let session = seed(&f.sessions, &f.stations).await;
        let mut draft = f.coordinator.open_settlement(&session, at(10, 42)).await.unwrap();
        assert!(matches!(
            draft.choose_apportionment(Apportionment::SecondaryPaysAll),
            Err(BillingError::ValidationError(_))
        ));
        assert_eq!(draft.apportionment(), Apportionment::PrimaryPaysAll);
    }
}
