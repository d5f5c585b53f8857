//! Error types for GATT operations
//!
//! Every failure in this crate is recoverable: the caller retries the
//! corresponding scan, connect or start operation.

use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::infrastructure::bluetooth::protocol::{AdvertiseErrorCode, GattStatus};
use thiserror::Error;

/// Errors surfaced by the scanner, central session, advertiser and server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Invalid identifier `{0}`: expected 8-4-4-4-12 hex UUID")]
    InvalidIdentifier(String),

    #[error("Scan failed with code {0}")]
    ScanFailed(i32),

    #[error("No device advertising {0} was found")]
    NoDeviceFound(ServiceId),

    #[error("Connection failed")]
    ConnectFailed,

    #[error("Service {0} not found on remote device")]
    ServiceNotFound(ServiceId),

    #[error("Characteristic {0} not found in service")]
    CharacteristicNotFound(CharacteristicId),

    #[error("Not connected")]
    NotConnected,

    #[error("Advertising failed: {0}")]
    AdvertiseFailed(AdvertiseErrorCode),

    #[error("Operation timed out")]
    OperationTimedOut,

    #[error("Remote answered with status {0}")]
    OperationFailed(GattStatus),

    /// A response arrived for a link or request that is no longer live.
    /// Never reported to the user.
    #[error("Stale response discarded")]
    StaleResponseDiscarded,

    #[error("Session closed before the operation completed")]
    SessionClosed,

    #[error("Radio error: {0}")]
    Radio(String),
}

pub type Result<T> = std::result::Result<T, GattError>;
