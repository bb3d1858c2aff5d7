//! Ranging capability seam
//!
//! The platform ranging subsystem sits behind [`RangingCapability`]. It runs
//! sessions from an accessory configuration blob and reports back through
//! [`RangingEvent`]s tagged with the session they belong to.

use crate::domain::errors::RangingError;
use crate::domain::models::{Direction, ElevationEstimate, SessionId};

/// Parsed accessory configuration, ready to start a session with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryConfiguration(pub Vec<u8>);

/// One measurement from a running session
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyUpdate {
    /// Meters
    pub distance: Option<f32>,
    /// Full direction vector, when the subsystem has one
    pub direction: Option<Direction>,
    /// Radians, available once the direction algorithm has converged
    pub horizontal_angle: Option<f32>,
    pub vertical: ElevationEstimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Peer stopped answering
    Timeout,
    /// Peer ended the session
    PeerEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangingEventKind {
    /// Host side configuration to hand to the accessory
    ShareableConfiguration(Vec<u8>),
    Update(NearbyUpdate),
    ConvergenceChanged(bool),
    Removed(RemovalReason),
    Suspended,
    SuspensionEnded,
    Invalidated(RangingError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangingEvent {
    pub session: SessionId,
    pub kind: RangingEventKind,
}

pub trait RangingCapability: Send {
    /// Validate the accessory configuration blob.
    fn parse_configuration(&self, payload: &[u8]) -> Result<AccessoryConfiguration, RangingError>;

    /// Allocate platform resources for a new session.
    fn create_session(&mut self, session: SessionId);

    /// Start ranging. The shareable configuration follows as an event.
    fn run(
        &mut self,
        session: SessionId,
        configuration: &AccessoryConfiguration,
    ) -> Result<(), RangingError>;

    /// Release the session. No further events are expected for it.
    fn invalidate(&mut self, session: SessionId);
}
