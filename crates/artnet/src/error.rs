//! Art-Net error types

use thiserror::Error;

/// Why a datagram is not a usable Art-Net packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("missing Art-Net header")]
    BadHeader,

    #[error("unsupported OpCode {0:#06x}")]
    UnsupportedOpCode(u16),

    #[error("protocol version {0} is too old")]
    OldProtocol(u16),

    #[error("invalid DMX length {0}")]
    BadLength(u16),
}

/// Art-Net plugin errors
#[derive(Debug, Error)]
pub enum ArtNetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device is already started")]
    AlreadyStarted,

    #[error("Device is not started")]
    NotStarted,
}

pub type Result<T> = std::result::Result<T, ArtNetError>;

impl From<ArtNetError> for common::Error {
    fn from(err: ArtNetError) -> Self {
        match err {
            ArtNetError::Io(e) => common::Error::Io(e),
            ArtNetError::Config(msg) => common::Error::Config(msg),
            other => common::Error::Other(other.to_string()),
        }
    }
}
