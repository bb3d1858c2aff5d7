use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of an accessory, derived from the peripheral identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one ranging session. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Lifecycle of an accessory as seen by the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceStatus {
    Discovered,
    Connected,
    Ranging,
}

/// Unit vector pointing from the host towards the accessory.
pub type Direction = [f32; 3];

/// Coarse vertical position of the accessory relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElevationEstimate {
    Above,
    Below,
    Same,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// Meters, never negative
    pub distance: f32,
    pub direction: Option<Direction>,
    pub elevation: ElevationEstimate,
    /// Set when the reading no longer reflects a live measurement
    pub stale: bool,
    /// Monotonic milliseconds of the last update
    pub updated_ms: u64,
}

/// One discovered accessory.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub status: DeviceStatus,
    /// Monotonic milliseconds of the last advertisement or status change
    pub last_seen_ms: u64,
    pub location: Option<Location>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, now_ms: u64) -> Self {
        let name = name.into();
        Self {
            id,
            name: if name.is_empty() {
                "Unknown".to_string()
            } else {
                name
            },
            status: DeviceStatus::Discovered,
            last_seen_ms: now_ms,
            location: None,
        }
    }

    /// Distance that can be trusted right now.
    pub fn fresh_distance(&self) -> Option<f32> {
        if self.status != DeviceStatus::Ranging {
            return None;
        }
        self.location
            .as_ref()
            .filter(|location| !location.stale)
            .map(|location| location.distance)
    }
}

/// State of a ranging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Suspended,
    Invalidated,
}

/// Everything the core reports to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    DeviceDiscovered {
        id: DeviceId,
        name: String,
    },
    DeviceRemoved(DeviceId),
    DeviceConnected(DeviceId),
    DeviceDisconnected(DeviceId),
    RangingStarted(DeviceId),
    RangingStopped(DeviceId),
    SessionStateChanged {
        id: DeviceId,
        session: SessionId,
        state: SessionState,
    },
    LocationUpdated {
        id: DeviceId,
        distance: f32,
        direction: Option<Direction>,
        /// Degrees, when a direction is known
        azimuth_deg: Option<f32>,
        elevation_deg: Option<f32>,
        elevation: ElevationEstimate,
    },
    PositionUpdated {
        x: f64,
        y: f64,
    },
    ProtocolError {
        id: DeviceId,
        reason: String,
    },
    TransportError {
        id: Option<DeviceId>,
        reason: String,
    },
    ConfigurationError {
        id: DeviceId,
        reason: String,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
