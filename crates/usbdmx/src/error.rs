//! USB DMX error types

use crate::transport::BusAddress;
use thiserror::Error;

/// Failure to open or claim a device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("device is busy")]
    Busy,

    #[error("permission denied")]
    PermissionDenied,

    #[error("device was removed")]
    Removed,

    #[error("{0}")]
    Other(String),
}

/// Failure of a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("short write: {actual} of {expected} bytes")]
    ShortWrite { expected: usize, actual: usize },

    #[error("endpoint stalled")]
    Stall,

    #[error("transfer timed out")]
    Timeout,

    #[error("device is gone")]
    DeviceGone,

    #[error("transfer was cancelled")]
    Cancelled,

    #[error("transfer overflow")]
    Overflow,

    #[error("a transfer is already in flight")]
    InFlight,

    #[error("{0}")]
    Other(String),
}

/// USB DMX plugin errors
#[derive(Debug, Error)]
pub enum UsbDmxError {
    #[error("Failed to open device: {0}")]
    Open(#[from] OpenError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Serial number unavailable for device at {0}")]
    IdentityUnavailable(BusAddress),

    #[error("Bus slot {0} already has a registered device")]
    RegistrationConflict(BusAddress),

    #[error("Widget is already initialised")]
    AlreadyInitialised,

    #[error("Failed to spawn worker thread: {0}")]
    Thread(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UsbDmxError>;
