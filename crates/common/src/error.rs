//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Plugin is already running")]
    AlreadyRunning,

    #[error("Plugin is not running")]
    NotRunning,

    #[error("Device {0} is already registered")]
    DuplicateDevice(String),

    #[error("Device {0} is not registered")]
    UnknownDevice(String),

    #[error("Descriptor {0} is already registered")]
    DuplicateDescriptor(i32),

    #[error("Port {0} does not exist")]
    NoSuchPort(u8),

    #[error("Port {0} is not patched to a universe")]
    Unpatched(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
