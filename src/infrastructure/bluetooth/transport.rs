//! Radio transport seam
//!
//! The radio stack sits behind [`Transport`]. Requests are fire-and-forget;
//! their outcomes come back later as [`TransportEvent`]s on the service
//! input channel.

use crate::domain::errors::TransportError;
use crate::domain::models::DeviceId;

/// Callbacks from the radio stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement from an accessory matching the scan filter
    Discovered { id: DeviceId, name: String },
    Connected(DeviceId),
    ConnectFailed { id: DeviceId, reason: String },
    /// Characteristic UUIDs offered by the connected accessory
    CharacteristicsDiscovered {
        id: DeviceId,
        characteristics: Vec<String>,
    },
    Disconnected { id: DeviceId, reason: Option<String> },
    /// One notification on the inbound channel
    Data { id: DeviceId, bytes: Vec<u8> },
}

impl TransportEvent {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::Discovered { id, .. }
            | Self::ConnectFailed { id, .. }
            | Self::CharacteristicsDiscovered { id, .. }
            | Self::Disconnected { id, .. }
            | Self::Data { id, .. } => *id,
            Self::Connected(id) => *id,
        }
    }
}

pub trait Transport: Send {
    /// Start delivering `Discovered` events for accessories advertising one of
    /// `service_uuids`.
    fn start_scan(&mut self, service_uuids: &[&str]) -> Result<(), TransportError>;

    fn stop_scan(&mut self) -> Result<(), TransportError>;

    /// Begin connecting. Completion arrives as `Connected` or `ConnectFailed`.
    fn connect(&mut self, id: DeviceId) -> Result<(), TransportError>;

    /// Ask for the characteristics of the accessory services.
    /// Completion arrives as `CharacteristicsDiscovered`.
    fn discover_characteristics(&mut self, id: DeviceId) -> Result<(), TransportError>;

    /// Enable notifications on an inbound characteristic.
    fn subscribe(&mut self, id: DeviceId, characteristic: &str) -> Result<(), TransportError>;

    /// Write one frame to an outbound characteristic.
    fn write(
        &mut self,
        id: DeviceId,
        characteristic: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    /// Tear the link down. Completion arrives as `Disconnected`.
    fn disconnect(&mut self, id: DeviceId) -> Result<(), TransportError>;
}
