use std::time::Duration;
use thiserror::Error;

/// Failures of the SQLite adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("Blocking store task failed: {0}")]
    Join(String),
}

/// Failures delivering a command to a device endpoint.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Endpoint not connected")]
    NotConnected,
    #[error("Endpoint rejected command: {0}")]
    Rejected(String),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Every outcome a caller of the rental lifecycle can observe.
#[derive(Debug, Error)]
pub enum RentalError {
    #[error("Duration must be a positive number of minutes")]
    InvalidDuration,
    #[error("Price must be a positive amount per hour")]
    InvalidPrice,
    #[error("Device {0} not found")]
    DeviceNotFound(i64),
    #[error("Device {0} is already running")]
    AlreadyRunning(String),
    #[error("Device {0} is not running")]
    NotRunning(String),
    #[error("Device endpoint unavailable: {0}")]
    EndpointUnavailable(#[from] DispatchError),
    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),
}

impl From<rusqlite::Error> for RentalError {
    fn from(e: rusqlite::Error) -> Self {
        RentalError::StoreFailure(StoreError::Sqlite(e))
    }
}

impl From<r2d2::Error> for RentalError {
    fn from(e: r2d2::Error) -> Self {
        RentalError::StoreFailure(StoreError::Pool(e))
    }
}
