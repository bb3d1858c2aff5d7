//! Accessory Protocol
//!
//! This module contains the protocol definitions for communicating with
//! ranging accessories over the BLE data channels.
//!
//! # Message Structure
//!
//! ```text
//! [0]    : Message identifier (see MessageId)
//! [1..]  : Payload, length given by the transport frame
//! ```
//!
//! There is no length field. One write or notification carries exactly one
//! message.

use crate::domain::errors::ProtocolError;
use tracing::trace;

/// Nordic UART style transfer service exposed by older accessory firmware
pub mod transfer_service {
    pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
    /// Host writes here
    pub const RX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
    /// Accessory notifies here
    pub const TX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
}

/// Dedicated ranging service exposed by newer accessory firmware
pub mod ranging_service {
    pub const SERVICE_UUID: &str = "2e938fd0-6a61-11ed-a1eb-0242ac120002";
    pub const SC_CHAR_UUID: &str = "2e93941c-6a61-11ed-a1eb-0242ac120002";
    /// Host writes here
    pub const RX_CHAR_UUID: &str = "2e93998a-6a61-11ed-a1eb-0242ac120002";
    /// Accessory notifies here
    pub const TX_CHAR_UUID: &str = "2e939af2-6a61-11ed-a1eb-0242ac120002";
}

/// Services to filter discovery by
pub const SCAN_SERVICE_UUIDS: &[&str] = &[
    transfer_service::SERVICE_UUID,
    ranging_service::SERVICE_UUID,
];

/// Leading tag byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Accessory configuration blob, sent in reply to `Initialize`
    ConfigurationData,
    /// Accessory started ranging
    RangingStarted,
    /// Accessory stopped ranging
    RangingStopped,
    /// Ask the accessory for its configuration
    Initialize,
    /// Host configuration blob; the accessory starts ranging on receipt
    ConfigureAndStart,
    /// Stop ranging
    Stop,
    /// User defined read request
    GetReserved,
    /// User defined write request
    SetReserved,
    /// User defined notification
    Notify,
}

impl MessageId {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::ConfigurationData => 0x01,
            Self::RangingStarted => 0x02,
            Self::RangingStopped => 0x03,
            Self::Initialize => 0x0A,
            Self::ConfigureAndStart => 0x0B,
            Self::Stop => 0x0C,
            Self::GetReserved => 0x20,
            Self::SetReserved => 0x21,
            Self::Notify => 0x2F,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::ConfigurationData,
            0x02 => Self::RangingStarted,
            0x03 => Self::RangingStopped,
            0x0A => Self::Initialize,
            0x0B => Self::ConfigureAndStart,
            0x0C => Self::Stop,
            0x20 => Self::GetReserved,
            0x21 => Self::SetReserved,
            0x2F => Self::Notify,
            _ => return None,
        })
    }

    /// Tags only the host may send
    pub fn is_host_only(self) -> bool {
        matches!(self, Self::Initialize | Self::ConfigureAndStart | Self::Stop)
    }
}

/// Messages an accessory may send to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessoryMessage {
    ConfigurationData(Vec<u8>),
    RangingStarted,
    RangingStopped,
    GetReserved(Vec<u8>),
    SetReserved(Vec<u8>),
    Notify(Vec<u8>),
}

impl AccessoryMessage {
    pub fn id(&self) -> MessageId {
        match self {
            Self::ConfigurationData(_) => MessageId::ConfigurationData,
            Self::RangingStarted => MessageId::RangingStarted,
            Self::RangingStopped => MessageId::RangingStopped,
            Self::GetReserved(_) => MessageId::GetReserved,
            Self::SetReserved(_) => MessageId::SetReserved,
            Self::Notify(_) => MessageId::Notify,
        }
    }
}

/// Messages the host sends to an accessory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    Initialize,
    ConfigureAndStart(Vec<u8>),
    Stop,
    GetReserved(Vec<u8>),
    SetReserved(Vec<u8>),
    Notify(Vec<u8>),
}

impl HostMessage {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Initialize => MessageId::Initialize,
            Self::ConfigureAndStart(_) => MessageId::ConfigureAndStart,
            Self::Stop => MessageId::Stop,
            Self::GetReserved(_) => MessageId::GetReserved,
            Self::SetReserved(_) => MessageId::SetReserved,
            Self::Notify(_) => MessageId::Notify,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Initialize | Self::Stop => &[],
            Self::ConfigureAndStart(payload)
            | Self::GetReserved(payload)
            | Self::SetReserved(payload)
            | Self::Notify(payload) => payload,
        }
    }

    /// Wire bytes for this message
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(self.id().as_byte());
        bytes.extend_from_slice(payload);
        bytes
    }
}

/// Parse one frame received from an accessory.
///
/// Fails closed: anything that is not a well-formed accessory message is
/// reported as a [`ProtocolError`] and nothing is guessed.
pub fn decode_from_accessory(bytes: &[u8]) -> Result<AccessoryMessage, ProtocolError> {
    let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;

    #[cfg(debug_assertions)]
    trace!("Raw frame: {:02X?}", bytes);

    let id = MessageId::from_byte(tag).ok_or(ProtocolError::UnknownTag(tag))?;
    if id.is_host_only() {
        return Err(ProtocolError::UnexpectedMessage(id));
    }

    Ok(match id {
        MessageId::ConfigurationData => {
            if payload.is_empty() {
                return Err(ProtocolError::MissingPayload(id));
            }
            AccessoryMessage::ConfigurationData(payload.to_vec())
        }
        MessageId::RangingStarted => AccessoryMessage::RangingStarted,
        MessageId::RangingStopped => AccessoryMessage::RangingStopped,
        MessageId::GetReserved => AccessoryMessage::GetReserved(payload.to_vec()),
        MessageId::SetReserved => AccessoryMessage::SetReserved(payload.to_vec()),
        MessageId::Notify => AccessoryMessage::Notify(payload.to_vec()),
        MessageId::Initialize | MessageId::ConfigureAndStart | MessageId::Stop => {
            return Err(ProtocolError::UnexpectedMessage(id))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_message_bytes() {
        assert_eq!(HostMessage::Initialize.encode(), vec![0x0A]);
        assert_eq!(HostMessage::Stop.encode(), vec![0x0C]);
        assert_eq!(
            HostMessage::ConfigureAndStart(vec![0xDE, 0xAD]).encode(),
            vec![0x0B, 0xDE, 0xAD]
        );
        assert_eq!(HostMessage::Notify(Vec::new()).encode(), vec![0x2F]);
    }

    #[test]
    fn test_decode_accessory_messages() {
        assert_eq!(
            decode_from_accessory(&[0x01, 0x10, 0x20]),
            Ok(AccessoryMessage::ConfigurationData(vec![0x10, 0x20]))
        );
        assert_eq!(decode_from_accessory(&[0x02]), Ok(AccessoryMessage::RangingStarted));
        assert_eq!(decode_from_accessory(&[0x03, 0xFF]), Ok(AccessoryMessage::RangingStopped));
        assert_eq!(
            decode_from_accessory(&[0x2F, 0x01]),
            Ok(AccessoryMessage::Notify(vec![0x01]))
        );
    }

    #[test]
    fn test_empty_frame_is_error() {
        assert_eq!(decode_from_accessory(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_unknown_tag_is_error() {
        assert_eq!(decode_from_accessory(&[0x7E]), Err(ProtocolError::UnknownTag(0x7E)));
        assert_eq!(decode_from_accessory(&[0x00, 0x01]), Err(ProtocolError::UnknownTag(0x00)));
    }

    #[test]
    fn test_host_only_tags_from_accessory_are_rejected() {
        for tag in [0x0A, 0x0B, 0x0C] {
            let err = decode_from_accessory(&[tag, 0x01]).unwrap_err();
            assert!(matches!(err, ProtocolError::UnexpectedMessage(id) if id.as_byte() == tag));
        }
    }

    #[test]
    fn test_configuration_without_payload_is_rejected() {
        assert_eq!(
            decode_from_accessory(&[0x01]),
            Err(ProtocolError::MissingPayload(MessageId::ConfigurationData))
        );
    }

    #[test]
    fn test_every_tag_maps_back() {
        for byte in 0..=u8::MAX {
            if let Some(id) = MessageId::from_byte(byte) {
                assert_eq!(id.as_byte(), byte);
            }
        }
    }
}
