//! Application layer: the session lifecycle workflows.
//!
//! [`engine::LoungeEngine`] is the entry point. It wires the station
//! coordinator, payment capture, settlement and void workflows over the
//! storage and gateway ports, and publishes [`crate::domain::events::BillingEvent`]s
//! for read-models such as [`timer::TimerBoard`].

pub mod capture;
pub mod engine;
pub mod occupancy;
pub mod push;
pub mod settlement;
pub mod timer;
pub mod void;

use crate::domain::session::{CustomerId, SessionId, StationId};
use std::fmt;

/// A degraded, non-fatal outcome that needs manual reconciliation. Money has
/// already changed hands, so these never roll an operation back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    StationNotReleased {
        station: StationId,
        reason: String,
    },
    PointsNotRecorded {
        customer: CustomerId,
        points: i64,
        reason: String,
    },
    LedgerUnavailable {
        session: SessionId,
        reason: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::StationNotReleased { station, reason } => {
                write!(f, "station {station} could not be freed: {reason}")
            }
            Warning::PointsNotRecorded {
                customer,
                points,
                reason,
            } => write!(
                f,
                "{points} points for customer {customer} were not recorded: {reason}"
            ),
            Warning::LedgerUnavailable { session, reason } => {
                write!(f, "loyalty entries for session {session} could not be read: {reason}")
            }
        }
    }
}
