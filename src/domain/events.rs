use super::money::Money;
use super::session::{CustomerId, SessionId, StationId};
use tokio::sync::broadcast;

/// Notifications published by the session workflows so read-models (boards,
/// balances, station maps) can refresh without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    SessionStarted {
        session: SessionId,
        station: StationId,
    },
    SessionSettled {
        session: SessionId,
        amount: Money,
        points: u32,
    },
    SessionForceEnded {
        session: SessionId,
    },
    SessionVoided {
        session: SessionId,
    },
    PointsChanged {
        customer: CustomerId,
        delta: i64,
    },
    StationReleased {
        station: StationId,
    },
}

impl BillingEvent {
    /// The session this event closes, if it ends the session's active life.
    pub fn closed_session(&self) -> Option<SessionId> {
        match self {
            BillingEvent::SessionSettled { session, .. }
            | BillingEvent::SessionForceEnded { session }
            | BillingEvent::SessionVoided { session } => Some(*session),
            _ => None,
        }
    }
}

/// Fan-out channel for [`BillingEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BillingEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
