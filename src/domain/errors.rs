//! Error types shared across the accessory core.
//!
//! Every error here is recovered at device or session granularity; none of
//! them is allowed to take the event loop down.

use crate::domain::models::DeviceId;
use thiserror::Error;

/// Malformed or unexpected bytes on the accessory link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag {0:#04X}")]
    UnknownTag(u8),
    #[error("accessory sent host-only message {0:?}")]
    UnexpectedMessage(crate::infrastructure::bluetooth::protocol::MessageId),
    #[error("message {0:?} requires a payload")]
    MissingPayload(crate::infrastructure::bluetooth::protocol::MessageId),
}

/// Failures reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("required characteristic missing: {0}")]
    MissingCharacteristic(&'static str),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("scan failed: {0}")]
    ScanFailed(String),
}

/// Errors raised by the discovery and connection driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("no such device: {0}")]
    NoSuchDevice(DeviceId),
    #[error("device {0} has no resolved data channel")]
    NotConnected(DeviceId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors reported by the ranging capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangingError {
    #[error("invalid accessory configuration: {0}")]
    InvalidConfiguration(String),
    #[error("ranging permission not granted")]
    PermissionDenied,
    #[error("ranging failure: {0}")]
    Other(String),
}

impl RangingError {
    /// Configuration and permission problems need outside action before
    /// ranging can work again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RangingError::InvalidConfiguration(_) | RangingError::PermissionDenied
        )
    }
}

/// Numerical failures of the position engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("anchors share the x coordinate {x}; trilateration is undefined")]
    DegenerateGeometry { x: f64 },
    #[error("need 2 fresh anchor readings, have {available}")]
    InsufficientAnchors { available: usize },
    #[error("non-finite value in trilateration input or output")]
    NonFinite,
    #[error("anchor table needs at least 2 anchors, got {0}")]
    TooFewAnchors(usize),
    #[error("anchor {0} listed twice")]
    DuplicateAnchor(DeviceId),
}
