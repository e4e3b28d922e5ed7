use super::session::StationId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StationStatus {
    Available,
    InUse,
    Maintenance,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationStatus::Available => f.write_str("available"),
            StationStatus::InUse => f.write_str("in-use"),
            StationStatus::Maintenance => f.write_str("maintenance"),
        }
    }
}

/// A physical play position. Held by at most one pending session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub status: StationStatus,
}

impl Station {
    pub fn new(id: StationId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: StationStatus::Available,
        }
    }
}
