use super::Warning;
use crate::domain::events::{BillingEvent, EventBus};
use crate::domain::loyalty::{LoyaltyKind, LoyaltyTransaction};
use crate::domain::ports::{LoyaltyLedgerRef, SessionStoreRef};
use crate::domain::session::{PaymentStatus, SessionId, SessionStage};
use crate::domain::staff::Staff;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidOutcome {
    Voided,
    /// The session was already cancelled; nothing was changed.
    AlreadyCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoidReport {
    pub session: SessionId,
    pub outcome: VoidOutcome,
    pub reversals: Vec<LoyaltyTransaction>,
    pub warnings: Vec<Warning>,
}

/// Reverses a paid session: `paid -> cancelled` plus one offsetting ledger
/// entry per earn entry. Stations and money are not touched.
#[derive(Clone)]
pub struct VoidWorkflow {
    sessions: SessionStoreRef,
    ledger: LoyaltyLedgerRef,
    events: EventBus,
}

impl VoidWorkflow {
    pub fn new(sessions: SessionStoreRef, ledger: LoyaltyLedgerRef, events: EventBus) -> Self {
        Self {
            sessions,
            ledger,
            events,
        }
    }

    pub async fn void_session(
        &self,
        id: SessionId,
        staff: &Staff,
        now: DateTime<Utc>,
    ) -> Result<VoidReport> {
        staff.require_admin("void a session")?;
        let session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("session {id}")))?;
        if session.status == PaymentStatus::Cancelled {
            return Ok(Self::already_cancelled(id));
        }

        let next = session.void(&staff.name, now)?;
        if self
            .sessions
            .compare_and_set(id, SessionStage::Settled, next)
            .await?
            == 0
        {
            // Lost a race with another void.
            return Ok(Self::already_cancelled(id));
        }
        info!(session = %id, actor = %staff.name, "session voided");
        self.events.publish(BillingEvent::SessionVoided { session: id });

        let mut warnings = Vec::new();
        let earned = match self.ledger.entries_for_session(id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(session = %id, error = %e, "could not read loyalty entries for void");
                warnings.push(Warning::LedgerUnavailable {
                    session: id,
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };

        let mut reversals = Vec::new();
        for entry in earned.iter().filter(|e| e.kind == LoyaltyKind::Earn) {
            let reversal = LoyaltyTransaction::reversal_of(entry, now);
            match self.ledger.append(reversal.clone()).await {
                Ok(()) => {
                    self.events.publish(BillingEvent::PointsChanged {
                        customer: reversal.customer,
                        delta: reversal.points,
                    });
                    reversals.push(reversal);
                }
                Err(e) => {
                    warn!(session = %id, customer = %entry.customer, error = %e, "reversal not recorded");
                    warnings.push(Warning::PointsNotRecorded {
                        customer: entry.customer,
                        points: reversal.points,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(VoidReport {
            session: id,
            outcome: VoidOutcome::Voided,
            reversals,
            warnings,
        })
    }

    fn already_cancelled(id: SessionId) -> VoidReport {
        info!(session = %id, "void skipped, session already cancelled");
        VoidReport {
            session: id,
            outcome: VoidOutcome::AlreadyCancelled,
            reversals: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::FailingLedger;
    use crate::domain::money::Money;
    use crate::domain::payment::CapturedPayment;
    use crate::domain::ports::{LoyaltyLedger, SessionStore};
    use crate::domain::session::tests::{at, pending_session};
    use crate::domain::session::{BillingMode, CustomerId, Session, SettledBilling};
    use crate::infrastructure::in_memory::{InMemoryLedger, InMemorySessionStore};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn paid_session(points: u32) -> Session {
        pending_session(BillingMode::PerHour, dec!(200))
            .settle(
                SettledBilling {
                    end_time: at(10, 42),
                    duration_minutes: 42,
                    amount_charged: Money::new(dec!(200)).unwrap(),
                    points_earned: points,
                },
                CapturedPayment::Cash,
            )
            .unwrap()
    }

    async fn workflow(
        ledger: LoyaltyLedgerRef,
        session: &Session,
    ) -> (VoidWorkflow, InMemorySessionStore) {
        let sessions = InMemorySessionStore::new();
        sessions.insert(session.clone()).await.unwrap();
        (
            VoidWorkflow::new(Arc::new(sessions.clone()), ledger, EventBus::default()),
            sessions,
        )
    }

    #[tokio::test]
    async fn test_void_reverses_earned_points() {
        let ledger = InMemoryLedger::new();
        let session = paid_session(20);
        ledger
            .append(LoyaltyTransaction::earn(CustomerId(1), session.id, 20, at(10, 42)))
            .await
            .unwrap();
        let (workflow, sessions) = workflow(Arc::new(ledger.clone()), &session).await;

        let report = workflow
            .void_session(session.id, &Staff::admin("amina"), at(12, 0))
            .await
            .unwrap();

        assert_eq!(report.outcome, VoidOutcome::Voided);
        assert_eq!(report.reversals.len(), 1);
        assert_eq!(report.reversals[0].points, -20);
        assert_eq!(report.reversals[0].kind, LoyaltyKind::Redeem);
        assert_eq!(ledger.balance(CustomerId(1)).await.unwrap(), 0);

        let stored = sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
        assert_eq!(stored.billing, session.billing);
        assert!(stored.notes.contains("amina"));
    }

    #[tokio::test]
    async fn test_void_with_no_earn_entries_succeeds() {
        let ledger = InMemoryLedger::new();
        let session = paid_session(0);
        let (workflow, _) = workflow(Arc::new(ledger.clone()), &session).await;

        let report = workflow
            .void_session(session.id, &Staff::admin("amina"), at(12, 0))
            .await
            .unwrap();
        assert_eq!(report.outcome, VoidOutcome::Voided);
        assert!(report.reversals.is_empty());
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_void_twice_is_a_no_op() {
        let ledger = InMemoryLedger::new();
        let session = paid_session(20);
        ledger
            .append(LoyaltyTransaction::earn(CustomerId(1), session.id, 20, at(10, 42)))
            .await
            .unwrap();
        let (workflow, _) = workflow(Arc::new(ledger.clone()), &session).await;
        let admin = Staff::admin("amina");

        workflow.void_session(session.id, &admin, at(12, 0)).await.unwrap();
        let again = workflow.void_session(session.id, &admin, at(12, 1)).await.unwrap();

        assert_eq!(again.outcome, VoidOutcome::AlreadyCancelled);
        assert_eq!(ledger.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_void_rejects_pending_and_attendants() {
        let ledger = InMemoryLedger::new();
        let session = pending_session(BillingMode::PerGame, dec!(150));
        let (workflow, sessions) = workflow(Arc::new(ledger), &session).await;

        assert!(matches!(
            workflow
                .void_session(session.id, &Staff::admin("amina"), at(12, 0))
                .await,
            Err(BillingError::InvalidTransition(_))
        ));
        assert!(matches!(
            workflow
                .void_session(session.id, &Staff::attendant("otieno"), at(12, 0))
                .await,
            Err(BillingError::Unauthorized(_))
        ));
        let stored = sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_ledger_outage_still_voids() {
        let session = paid_session(20);
        let (workflow, sessions) = workflow(Arc::new(FailingLedger), &session).await;

        let report = workflow
            .void_session(session.id, &Staff::admin("amina"), at(12, 0))
            .await
            .unwrap();
        assert_eq!(report.outcome, VoidOutcome::Voided);
        assert!(matches!(
            report.warnings.as_slice(),
            [Warning::LedgerUnavailable { .. }]
        ));
        let stored = sessions.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
    }
}
