use thiserror::Error;

/// Errors produced by the session lifecycle and settlement engine.
///
/// The variants mirror how staff are expected to react: validation problems
/// are fixed inline, gateway problems are retried with a fresh push,
/// persistence problems abort the operation, and logical errors mean the
/// requested transition is not allowed from the current state.
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Payment gateway error: {0}")]
    GatewayError(String),
    #[error("Persistence error: {0}")]
    PersistenceError(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Station {0} is not available")]
    StationUnavailable(u32),
    #[error("Not allowed: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),
}

impl BillingError {
    /// Whether staff can resolve the failure by correcting input or retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_)
                | Self::GatewayError(_)
                | Self::PersistenceError(_)
                | Self::HttpError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
