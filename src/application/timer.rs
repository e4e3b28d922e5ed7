//! Per-session display timers.
//!
//! Per-hour sessions count down from `start + block`, firing a warning and an
//! expiry alert at most once each. Per-game sessions show elapsed time on a
//! coarser cadence. Every timer is an independent task owned by a
//! [`TimerHandle`]; dropping the handle stops it.

use crate::config::BillingConfig;
use crate::domain::events::BillingEvent;
use crate::domain::ports::{ClockRef, SessionStoreRef};
use crate::domain::session::{BillingMode, Session, SessionId};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualState {
    Normal,
    Warning,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAlert {
    FiveMinuteWarning,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerDisplay {
    Countdown {
        time_left: Duration,
        /// Remaining fraction of the block, clamped to `0.0..=1.0`.
        progress: f64,
        visual: VisualState,
    },
    Elapsed {
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerEvent {
    pub session: SessionId,
    pub display: TimerDisplay,
    pub alert: Option<TimerAlert>,
}

/// Edge-triggered threshold tracking for one countdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountdownState {
    warned: bool,
    expired: bool,
}

impl CountdownState {
    pub fn observe(
        &mut self,
        time_left: Duration,
        warning_threshold: Duration,
    ) -> (VisualState, Option<TimerAlert>) {
        if time_left <= Duration::zero() {
            let alert = (!self.expired).then_some(TimerAlert::Expired);
            self.expired = true;
            (VisualState::Expired, alert)
        } else if time_left <= warning_threshold {
            let alert = (!self.warned).then_some(TimerAlert::FiveMinuteWarning);
            self.warned = true;
            (VisualState::Warning, alert)
        } else {
            (VisualState::Normal, None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub block: Duration,
    pub warning_threshold: Duration,
    pub countdown_tick: std::time::Duration,
    pub elapsed_refresh: std::time::Duration,
}

impl From<&BillingConfig> for TimerSettings {
    fn from(config: &BillingConfig) -> Self {
        Self {
            block: Duration::minutes(config.hourly_block_minutes),
            warning_threshold: config.warning_threshold(),
            countdown_tick: config.countdown_tick(),
            elapsed_refresh: config.elapsed_refresh(),
        }
    }
}

/// Owner of one running timer. Dropping it stops the timer.
pub struct TimerHandle {
    session: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SessionTimer;

impl SessionTimer {
    /// Starts the timer for `session`, sending a [`TimerEvent`] on every tick.
    pub fn mount(
        session: &Session,
        settings: TimerSettings,
        clock: ClockRef,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> TimerHandle {
        let cancel = CancellationToken::new();
        let id = session.id;
        let start = session.start_time;
        let task = match session.mode {
            BillingMode::PerHour => tokio::spawn(run_countdown(
                id,
                start,
                settings,
                clock,
                events,
                cancel.clone(),
            )),
            BillingMode::PerGame => tokio::spawn(run_elapsed(
                id,
                start,
                settings.elapsed_refresh,
                clock,
                events,
                cancel.clone(),
            )),
        };
        TimerHandle {
            session: id,
            cancel,
            task,
        }
    }
}

/// Countdown display at `now` for a block that started at `start`.
pub fn countdown_at(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    block: Duration,
) -> (Duration, f64) {
    let time_left = start + block - now;
    let progress = if block <= Duration::zero() {
        0.0
    } else {
        (time_left.num_milliseconds() as f64 / block.num_milliseconds() as f64).clamp(0.0, 1.0)
    };
    (time_left, progress)
}

async fn run_countdown(
    session: SessionId,
    start: DateTime<Utc>,
    settings: TimerSettings,
    clock: ClockRef,
    events: mpsc::UnboundedSender<TimerEvent>,
    cancel: CancellationToken,
) {
    let mut state = CountdownState::default();
    let mut interval = tokio::time::interval(settings.countdown_tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let (time_left, progress) = countdown_at(start, clock.now(), settings.block);
        let (visual, alert) = state.observe(time_left, settings.warning_threshold);
        if let Some(alert) = alert {
            debug!(%session, ?alert, "timer threshold reached");
        }
        let event = TimerEvent {
            session,
            display: TimerDisplay::Countdown {
                time_left,
                progress,
                visual,
            },
            alert,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

async fn run_elapsed(
    session: SessionId,
    start: DateTime<Utc>,
    refresh: std::time::Duration,
    clock: ClockRef,
    events: mpsc::UnboundedSender<TimerEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(refresh);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let elapsed = (clock.now() - start).max(Duration::zero());
        let event = TimerEvent {
            session,
            display: TimerDisplay::Elapsed { elapsed },
            alert: None,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Read-model of the active-sessions board: one timer per displayed session,
/// mounted when a session starts and torn down when it is settled,
/// force-ended or voided.
pub struct TimerBoard {
    sessions: SessionStoreRef,
    clock: ClockRef,
    settings: TimerSettings,
    events: mpsc::UnboundedSender<TimerEvent>,
    timers: HashMap<SessionId, TimerHandle>,
}

impl TimerBoard {
    pub fn new(
        sessions: SessionStoreRef,
        clock: ClockRef,
        settings: TimerSettings,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            sessions,
            clock,
            settings,
            events,
            timers: HashMap::new(),
        }
    }

    /// Mounts timers for every pending session in the store.
    pub async fn load_active(&mut self) -> Result<usize> {
        for session in self.sessions.list_pending().await? {
            self.mount(&session);
        }
        Ok(self.timers.len())
    }

    pub fn mount(&mut self, session: &Session) {
        if self.timers.contains_key(&session.id) {
            return;
        }
        let handle = SessionTimer::mount(
            session,
            self.settings,
            self.clock.clone(),
            self.events.clone(),
        );
        self.timers.insert(session.id, handle);
    }

    pub fn unmount(&mut self, session: SessionId) -> bool {
        self.timers.remove(&session).is_some()
    }

    pub fn is_mounted(&self, session: SessionId) -> bool {
        self.timers.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Reacts to a workflow notification.
    pub async fn apply(&mut self, event: &BillingEvent) -> Result<()> {
        if let BillingEvent::SessionStarted { session, .. } = event {
            if let Some(row) = self.sessions.get(*session).await? {
                self.mount(&row);
            }
        } else if let Some(session) = event.closed_session() {
            self.unmount(session);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SessionStore;
    use crate::domain::session::tests::{at, pending_session};
    use crate::infrastructure::in_memory::{InMemorySessionStore, ManualClock};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn settings() -> TimerSettings {
        TimerSettings::from(&BillingConfig::default())
    }

    #[test]
    fn test_thresholds_fire_once() {
        let threshold = Duration::minutes(5);
        let mut state = CountdownState::default();

        assert_eq!(
            state.observe(Duration::minutes(10), threshold),
            (VisualState::Normal, None)
        );
        assert_eq!(
            state.observe(Duration::minutes(5), threshold),
            (VisualState::Warning, Some(TimerAlert::FiveMinuteWarning))
        );
        assert_eq!(
            state.observe(Duration::minutes(4), threshold),
            (VisualState::Warning, None)
        );
        assert_eq!(
            state.observe(Duration::zero(), threshold),
            (VisualState::Expired, Some(TimerAlert::Expired))
        );
        assert_eq!(
            state.observe(Duration::minutes(-3), threshold),
            (VisualState::Expired, None)
        );
    }

    #[test]
    fn test_late_mount_skips_warning() {
        let mut state = CountdownState::default();
        assert_eq!(
            state.observe(Duration::minutes(-1), Duration::minutes(5)),
            (VisualState::Expired, Some(TimerAlert::Expired))
        );
    }

    #[test]
    fn test_countdown_progress() {
        let block = Duration::minutes(60);
        let (left, progress) = countdown_at(at(10, 0), at(10, 15), block);
        assert_eq!(left, Duration::minutes(45));
        assert!((progress - 0.75).abs() < f64::EPSILON);

        let (left, progress) = countdown_at(at(10, 0), at(11, 30), block);
        assert_eq!(left, Duration::minutes(-30));
        assert_eq!(progress, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_task_alerts_and_stops_on_drop() {
        let session = pending_session(BillingMode::PerHour, dec!(200));
        let clock = ManualClock::new(session.start_time + Duration::seconds(54 * 60 + 58));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = SessionTimer::mount(&session, settings(), Arc::new(clock.clone()), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.alert, None);

        clock.set(session.start_time + Duration::minutes(55) + Duration::seconds(30));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.alert, Some(TimerAlert::FiveMinuteWarning));

        clock.set(session.start_time + Duration::minutes(56));
        assert_eq!(rx.recv().await.unwrap().alert, None);

        clock.set(session.start_time + Duration::minutes(60));
        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.alert, Some(TimerAlert::Expired));
        assert!(matches!(
            expired.display,
            TimerDisplay::Countdown {
                visual: VisualState::Expired,
                ..
            }
        ));

        clock.set(session.start_time + Duration::minutes(61));
        assert_eq!(rx.recv().await.unwrap().alert, None);

        drop(handle);
        while rx.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_game_shows_elapsed_on_coarse_cadence() {
        let session = pending_session(BillingMode::PerGame, dec!(150));
        let clock = ManualClock::new(session.start_time + Duration::minutes(12));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();

        let _handle = SessionTimer::mount(&session, settings(), Arc::new(clock.clone()), tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.display,
            TimerDisplay::Elapsed {
                elapsed: Duration::minutes(12)
            }
        );

        rx.recv().await.unwrap();
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_mounts_and_tears_down_on_events() {
        let store = InMemorySessionStore::new();
        let session = pending_session(BillingMode::PerHour, dec!(200));
        store.insert(session.clone()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut board = TimerBoard::new(
            Arc::new(store.clone()),
            Arc::new(ManualClock::new(session.start_time)),
            settings(),
            tx,
        );

        board
            .apply(&BillingEvent::SessionStarted {
                session: session.id,
                station: session.station,
            })
            .await
            .unwrap();
        assert!(board.is_mounted(session.id));

        board
            .apply(&BillingEvent::SessionForceEnded {
                session: session.id,
            })
            .await
            .unwrap();
        assert!(!board.is_mounted(session.id));
        assert!(board.is_empty());

        assert_eq!(board.load_active().await.unwrap(), 1);
        assert_eq!(board.len(), 1);
    }
}
