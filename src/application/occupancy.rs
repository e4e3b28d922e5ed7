use crate::domain::events::{BillingEvent, EventBus};
use crate::domain::ports::StationStoreRef;
use crate::domain::session::StationId;
use crate::domain::station::StationStatus;
use crate::error::{BillingError, Result};
use tracing::{debug, info};

/// Binds station availability to session start, settlement, force-end and void.
///
/// The station row is the source of truth for whether a new session may
/// start; billing code never reads-modifies-writes it.
#[derive(Clone)]
pub struct StationCoordinator {
    stations: StationStoreRef,
    events: EventBus,
}

impl StationCoordinator {
    pub fn new(stations: StationStoreRef, events: EventBus) -> Self {
        Self { stations, events }
    }

    /// `available -> in-use`. Fails if the station is missing or not available.
    pub async fn claim(&self, station: StationId) -> Result<()> {
        let affected = self
            .stations
            .transition(
                station,
                Some(StationStatus::Available),
                StationStatus::InUse,
            )
            .await?;
        if affected == 0 {
            return match self.stations.get(station).await? {
                Some(_) => Err(BillingError::StationUnavailable(station.0)),
                None => Err(BillingError::NotFound(format!("station {station}"))),
            };
        }
        info!(%station, "station claimed");
        Ok(())
    }

    /// Frees the station regardless of its previous status. Idempotent.
    pub async fn release(&self, station: StationId) -> Result<()> {
        let affected = self
            .stations
            .transition(station, None, StationStatus::Available)
            .await?;
        if affected == 0 {
            return Err(BillingError::NotFound(format!("station {station}")));
        }
        debug!(%station, "station released");
        self.events.publish(BillingEvent::StationReleased { station });
        Ok(())
    }
}
