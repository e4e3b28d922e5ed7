//! Mobile-money push payments.
//!
//! One [`PushHandle`] owns one attempt: a spawned task sends the push, then
//! polls the session row on a fixed interval until the webhook's confirmation
//! shows up, the deadline passes, or the handle is dropped. The task publishes
//! every state change through a `watch` channel.

use crate::config::BillingConfig;
use crate::domain::money::Money;
use crate::domain::payment::{AttemptState, CapturedPayment, PaymentAttempt, PhoneNumber};
use crate::domain::ports::{GatewayRef, PushOutcome, PushRequest, SessionStoreRef};
use crate::domain::session::{PaymentStatus, Session, SessionId};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl From<&BillingConfig> for PushSettings {
    fn from(config: &BillingConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.push_timeout(),
        }
    }
}

/// Starts push attempts against a gateway and a session store.
#[derive(Clone)]
pub struct PushPaymentFlow {
    gateway: GatewayRef,
    sessions: SessionStoreRef,
    settings: PushSettings,
}

impl PushPaymentFlow {
    pub fn new(gateway: GatewayRef, sessions: SessionStoreRef, settings: PushSettings) -> Self {
        Self {
            gateway,
            sessions,
            settings,
        }
    }

    /// Sends a push for `amount` to `phone` and starts polling. Each call is
    /// a fresh attempt with its own deadline.
    pub fn start(&self, session: SessionId, amount: Money, phone: PhoneNumber) -> PushHandle {
        let (tx, rx) = watch::channel(PaymentAttempt::default());
        let cancel = CancellationToken::new();
        let request = PushRequest {
            amount,
            phone: phone.clone(),
            session,
        };
        let task = tokio::spawn(run_attempt(
            self.gateway.clone(),
            self.sessions.clone(),
            self.settings,
            request,
            tx,
            cancel.clone(),
        ));
        PushHandle {
            phone,
            state: rx,
            cancel,
            task,
        }
    }
}

/// Owner of one push attempt. Dropping it stops the poll loop.
pub struct PushHandle {
    phone: PhoneNumber,
    state: watch::Receiver<PaymentAttempt>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PushHandle {
    pub fn current(&self) -> PaymentAttempt {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentAttempt> {
        self.state.clone()
    }

    /// Waits until the attempt succeeds, fails, or is cancelled.
    pub async fn finished(&mut self) -> PaymentAttempt {
        // An error here means the task ended; the last published state stands.
        let _ = self.state.wait_for(|a| a.state.is_terminal()).await;
        self.current()
    }

    /// The captured payment, available only once the attempt succeeded.
    pub fn captured(&self) -> Option<CapturedPayment> {
        match &self.state.borrow().state {
            AttemptState::Success { reference } => Some(CapturedPayment::MobileMoneyPush {
                phone: self.phone.clone(),
                reference: reference.clone(),
            }),
            _ => None,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PushHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The reference to adopt if the row shows the payment went through.
fn confirmed_reference(session: &Session) -> Option<String> {
    match session.status {
        PaymentStatus::Pending => session.gateway_reference.clone(),
        PaymentStatus::Paid => session
            .mpesa_reference()
            .map(str::to_string)
            .or_else(|| session.gateway_reference.clone()),
        PaymentStatus::Cancelled => None,
    }
}

async fn run_attempt(
    gateway: GatewayRef,
    sessions: SessionStoreRef,
    settings: PushSettings,
    request: PushRequest,
    tx: watch::Sender<PaymentAttempt>,
    cancel: CancellationToken,
) {
    let session = request.session;
    let started = Instant::now();
    let publish = |state: AttemptState| {
        tx.send_replace(PaymentAttempt {
            state,
            elapsed: started.elapsed(),
        });
    };

    // One deadline bounds the whole attempt, including a send or a poll that
    // never answers.
    let deadline = tokio::time::sleep_until(started + settings.timeout);
    tokio::pin!(deadline);

    publish(AttemptState::Sending);
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        outcome = gateway.initiate_push(request) => outcome,
        () = &mut deadline => {
            publish(timed_out(session, settings.timeout));
            return;
        }
    };
    match outcome {
        Ok(PushOutcome::Accepted { checkout_id }) => {
            info!(%session, %checkout_id, "push accepted, polling for confirmation");
        }
        Ok(PushOutcome::Rejected { reason }) => {
            warn!(%session, %reason, "push rejected by gateway");
            publish(AttemptState::Error { message: reason });
            return;
        }
        Err(e) => {
            warn!(%session, error = %e, "push request failed");
            publish(AttemptState::Error {
                message: e.to_string(),
            });
            return;
        }
    }
    publish(AttemptState::Pending);

    let mut interval =
        tokio::time::interval_at(started + settings.poll_interval, settings.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%session, "push polling cancelled");
                return;
            }
            _ = interval.tick() => {}
            () = &mut deadline => break,
        }

        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%session, "push polling cancelled mid-poll");
                return;
            }
            polled = sessions.get(session) => polled,
            () = &mut deadline => break,
        };
        match polled {
            Ok(Some(row)) => {
                if let Some(reference) = confirmed_reference(&row) {
                    info!(%session, %reference, "push payment confirmed");
                    publish(AttemptState::Success { reference });
                    return;
                }
                if row.status == PaymentStatus::Cancelled {
                    publish(AttemptState::Error {
                        message: "Session was cancelled while awaiting payment".to_string(),
                    });
                    return;
                }
            }
            Ok(None) => {
                publish(AttemptState::Error {
                    message: format!("Session {session} no longer exists"),
                });
                return;
            }
            Err(e) => warn!(%session, error = %e, "poll failed, will retry"),
        }
        debug!(%session, elapsed = ?started.elapsed(), "push still pending");
        publish(AttemptState::Pending);
    }

    publish(timed_out(session, settings.timeout));
}

fn timed_out(session: SessionId, timeout: Duration) -> AttemptState {
    warn!(%session, "push payment timed out");
    AttemptState::Error {
        message: format!(
            "No confirmation received within {} seconds; ask the customer to retry",
            timeout.as_secs()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SessionStore;
    use crate::domain::session::{BillingMode, SessionStage};
    use crate::domain::session::tests::pending_session;
    use crate::infrastructure::in_memory::{GatewayScript, InMemorySessionStore, ScriptedGateway};
    use crate::error::Result;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    /// Session store whose reads hang for `delay` before answering.
    #[derive(Clone)]
    struct StalledSessionStore {
        inner: InMemorySessionStore,
        delay: Duration,
    }

    #[async_trait]
    impl SessionStore for StalledSessionStore {
        async fn insert(&self, session: Session) -> Result<()> {
            self.inner.insert(session).await
        }

        async fn get(&self, id: SessionId) -> Result<Option<Session>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(id).await
        }

        async fn compare_and_set(
            &self,
            id: SessionId,
            expected: SessionStage,
            next: Session,
        ) -> Result<u64> {
            self.inner.compare_and_set(id, expected, next).await
        }

        async fn list_pending(&self) -> Result<Vec<Session>> {
            self.inner.list_pending().await
        }
    }

    async fn stalled_fixture() -> (PushPaymentFlow, InMemorySessionStore, Session) {
        let store = InMemorySessionStore::new();
        let session = pending_session(BillingMode::PerHour, dec!(200));
        store.insert(session.clone()).await.unwrap();
        let stalled = StalledSessionStore {
            inner: store.clone(),
            delay: Duration::from_secs(100),
        };
        let gateway = ScriptedGateway::new(GatewayScript::Silent, Arc::new(store.clone()));
        let flow = PushPaymentFlow::new(Arc::new(gateway), Arc::new(stalled), settings());
        (flow, store, session)
    }

    fn settings() -> PushSettings {
        PushSettings {
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(60),
        }
    }

    async fn fixture(script: GatewayScript) -> (PushPaymentFlow, InMemorySessionStore, Session) {
        let store = InMemorySessionStore::new();
        let session = pending_session(BillingMode::PerHour, dec!(200));
        store.insert(session.clone()).await.unwrap();
        let gateway = ScriptedGateway::new(script, Arc::new(store.clone()));
        let flow = PushPaymentFlow::new(Arc::new(gateway), Arc::new(store.clone()), settings());
        (flow, store, session)
    }

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("0712345678").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_moves_attempt_to_success() {
        let (flow, store, session) = fixture(GatewayScript::Confirm {
            after: Duration::from_secs(7),
            reference: "QHK3X9A1BC".to_string(),
        })
        .await;

        let mut handle = flow.start(session.id, session.rate.as_money(), phone());
        let attempt = handle.finished().await;

        assert_eq!(
            attempt.state,
            AttemptState::Success {
                reference: "QHK3X9A1BC".to_string()
            }
        );
        // Confirmed at 7s, observed on the 9s poll.
        assert_eq!(attempt.elapsed, Duration::from_secs(9));
        assert_eq!(
            handle.captured(),
            Some(CapturedPayment::MobileMoneyPush {
                phone: phone(),
                reference: "QHK3X9A1BC".to_string(),
            })
        );

        // Polls at 3, 6 and 9 seconds plus the webhook's own read at 7.
        assert_eq!(store.reads(), 4);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.reads(), 4);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_times_out_and_stops_polling() {
        let (flow, store, session) = fixture(GatewayScript::Silent).await;
        let started = Instant::now();

        let mut handle = flow.start(session.id, session.rate.as_money(), phone());
        let attempt = handle.finished().await;

        assert!(matches!(attempt.state, AttemptState::Error { .. }));
        assert!(attempt.last_error().unwrap().contains("60 seconds"));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        // Polls at 3, 6, ..., 60.
        assert_eq!(store.reads(), 20);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.reads(), 20);
        assert!(handle.captured().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ends_attempt_while_poll_is_stuck() {
        let (flow, store, session) = stalled_fixture().await;
        let started = Instant::now();

        let mut handle = flow.start(session.id, session.rate.as_money(), phone());
        let attempt = handle.finished().await;

        assert!(attempt.last_error().unwrap().contains("60 seconds"));
        assert_eq!(attempt.elapsed, Duration::from_secs(60));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        // The first read was still hanging when the deadline hit.
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stuck_poll() {
        let (flow, store, session) = stalled_fixture().await;

        let handle = flow.start(session.id, session.rate.as_money(), phone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.current().state, AttemptState::Pending);
        assert!(handle.is_running());

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_running());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_reported_without_polling() {
        let (flow, store, session) = fixture(GatewayScript::Reject {
            reason: "Insufficient balance".to_string(),
        })
        .await;

        let mut handle = flow.start(session.id, session.rate.as_money(), phone());
        let attempt = handle.finished().await;

        assert_eq!(attempt.last_error(), Some("Insufficient balance"));
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let (flow, store, session) = fixture(GatewayScript::Silent).await;

        let handle = flow.start(session.id, session.rate.as_money(), phone());
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(store.reads(), 3);
        assert_eq!(handle.current().state, AttemptState::Pending);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gets_a_fresh_window() {
        let (flow, _, session) = fixture(GatewayScript::Silent).await;

        let mut first = flow.start(session.id, session.rate.as_money(), phone());
        assert!(matches!(
            first.finished().await.state,
            AttemptState::Error { .. }
        ));

        let started = Instant::now();
        let mut second = flow.start(session.id, session.rate.as_money(), phone());
        second.finished().await;
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_ends_attempt() {
        let (flow, store, session) = fixture(GatewayScript::Silent).await;
        let mut handle = flow.start(session.id, session.rate.as_money(), phone());

        tokio::time::sleep(Duration::from_secs(4)).await;
        let ended = session.force_end("amina", session.start_time).unwrap();
        store
            .compare_and_set(session.id, SessionStage::Open, ended)
            .await
            .unwrap();

        let attempt = handle.finished().await;
        assert!(attempt.last_error().unwrap().contains("cancelled"));
        assert_eq!(store.reads(), 2);
    }
}
