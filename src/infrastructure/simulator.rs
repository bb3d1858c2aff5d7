//! Simulated accessories for development and demos
//!
//! [`SimulatedTransport`] plays the radio and the accessory firmware: it
//! advertises, answers the handshake and echoes link events.
//! [`SimulatedRanging`] plays the platform ranging subsystem and streams
//! distances from a host that walks a circle between the anchors.

use crate::domain::errors::{RangingError, TransportError};
use crate::domain::models::{DeviceId, ElevationEstimate, SessionId};
use crate::infrastructure::bluetooth::protocol::{ranging_service, MessageId};
use crate::infrastructure::bluetooth::service::ServiceInput;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use crate::infrastructure::ranging::{
    AccessoryConfiguration, NearbyUpdate, RangingCapability, RangingEvent, RangingEventKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const ADVERTISING_INTERVAL_MS: u64 = 500;
const UPDATE_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct SimulatedAccessory {
    pub id: DeviceId,
    pub name: String,
    pub x: f64,
    pub y: f64,
}

/// Accessories plus the path the host walks
#[derive(Debug)]
pub struct Scene {
    pub accessories: Vec<SimulatedAccessory>,
    center: (f64, f64),
    radius: f64,
    /// Radians per second
    angular_speed: f64,
    started: Instant,
}

impl Scene {
    pub fn new(accessories: Vec<SimulatedAccessory>) -> Self {
        Self {
            accessories,
            center: (1.25, 1.0),
            radius: 0.5,
            angular_speed: 0.5,
            started: Instant::now(),
        }
    }

    /// Host position `elapsed` into the walk
    pub fn host_at(&self, elapsed: Duration) -> (f64, f64) {
        let angle = self.angular_speed * elapsed.as_secs_f64();
        (
            self.center.0 + self.radius * angle.cos(),
            self.center.1 + self.radius * angle.sin(),
        )
    }

    fn accessory(&self, id: DeviceId) -> Option<&SimulatedAccessory> {
        self.accessories.iter().find(|a| a.id == id)
    }

    fn measure(&self, id: DeviceId) -> Option<NearbyUpdate> {
        let accessory = self.accessory(id)?;
        let (hx, hy) = self.host_at(self.started.elapsed());
        let (dx, dy) = (accessory.x - hx, accessory.y - hy);
        let distance = (dx * dx + dy * dy).sqrt();
        let angle = dx.atan2(dy);
        Some(NearbyUpdate {
            distance: Some(distance as f32),
            direction: None,
            horizontal_angle: Some(angle as f32),
            vertical: ElevationEstimate::Same,
        })
    }
}

/// Radio and accessory firmware in one
pub struct SimulatedTransport {
    scene: Arc<Scene>,
    inputs: mpsc::UnboundedSender<ServiceInput>,
    advertiser: Option<JoinHandle<()>>,
}

impl SimulatedTransport {
    pub fn new(scene: Arc<Scene>, inputs: mpsc::UnboundedSender<ServiceInput>) -> Self {
        Self {
            scene,
            inputs,
            advertiser: None,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.inputs.send(event.into());
    }

    fn reply(&self, id: DeviceId, bytes: Vec<u8>) {
        self.emit(TransportEvent::Data { id, bytes });
    }

    fn known(&self, id: DeviceId) -> Result<(), TransportError> {
        self.scene
            .accessory(id)
            .map(|_| ())
            .ok_or_else(|| TransportError::ConnectFailed(format!("no accessory {}", id)))
    }
}

impl Transport for SimulatedTransport {
    fn start_scan(&mut self, _service_uuids: &[&str]) -> Result<(), TransportError> {
        if self.advertiser.is_some() {
            return Ok(());
        }
        let scene = Arc::clone(&self.scene);
        let inputs = self.inputs.clone();
        self.advertiser = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(ADVERTISING_INTERVAL_MS));
            loop {
                interval.tick().await;
                for accessory in &scene.accessories {
                    let event = TransportEvent::Discovered {
                        id: accessory.id,
                        name: accessory.name.clone(),
                    };
                    if inputs.send(event.into()).is_err() {
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.abort();
        }
        Ok(())
    }

    fn connect(&mut self, id: DeviceId) -> Result<(), TransportError> {
        self.known(id)?;
        self.emit(TransportEvent::Connected(id));
        Ok(())
    }

    fn discover_characteristics(&mut self, id: DeviceId) -> Result<(), TransportError> {
        self.known(id)?;
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id,
            characteristics: vec![
                ranging_service::SC_CHAR_UUID.to_string(),
                ranging_service::RX_CHAR_UUID.to_string(),
                ranging_service::TX_CHAR_UUID.to_string(),
            ],
        });
        Ok(())
    }

    fn subscribe(&mut self, _id: DeviceId, _characteristic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn write(&mut self, id: DeviceId, _characteristic: &str, bytes: &[u8]) -> Result<(), TransportError> {
        self.known(id).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        trace!("Accessory {} got {:02X?}", id, bytes);

        match bytes.first().copied().and_then(MessageId::from_byte) {
            Some(MessageId::Initialize) => {
                // The configuration blob carries the accessory identity
                let mut reply = vec![MessageId::ConfigurationData.as_byte()];
                reply.extend_from_slice(&id.0.to_le_bytes());
                self.reply(id, reply);
            }
            Some(MessageId::ConfigureAndStart) => {
                self.reply(id, vec![MessageId::RangingStarted.as_byte()]);
            }
            Some(MessageId::Stop) => {
                self.reply(id, vec![MessageId::RangingStopped.as_byte()]);
            }
            other => debug!("Accessory {} ignores {:?}", id, other),
        }
        Ok(())
    }

    fn disconnect(&mut self, id: DeviceId) -> Result<(), TransportError> {
        self.emit(TransportEvent::Disconnected { id, reason: None });
        Ok(())
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        let _ = self.stop_scan();
    }
}

/// Ranging subsystem streaming synthetic measurements
pub struct SimulatedRanging {
    scene: Arc<Scene>,
    inputs: mpsc::UnboundedSender<ServiceInput>,
    streams: HashMap<SessionId, JoinHandle<()>>,
}

impl SimulatedRanging {
    pub fn new(scene: Arc<Scene>, inputs: mpsc::UnboundedSender<ServiceInput>) -> Self {
        Self {
            scene,
            inputs,
            streams: HashMap::new(),
        }
    }
}

impl RangingCapability for SimulatedRanging {
    fn parse_configuration(&self, payload: &[u8]) -> Result<AccessoryConfiguration, RangingError> {
        if payload.len() != 8 {
            return Err(RangingError::InvalidConfiguration(format!(
                "expected 8 bytes, got {}",
                payload.len()
            )));
        }
        Ok(AccessoryConfiguration(payload.to_vec()))
    }

    fn create_session(&mut self, session: SessionId) {
        debug!("Simulated session {} created", session);
    }

    fn run(
        &mut self,
        session: SessionId,
        configuration: &AccessoryConfiguration,
    ) -> Result<(), RangingError> {
        let raw: [u8; 8] = configuration
            .0
            .as_slice()
            .try_into()
            .map_err(|_| RangingError::InvalidConfiguration("bad length".into()))?;
        let id = DeviceId(u64::from_le_bytes(raw));
        if self.scene.accessory(id).is_none() {
            return Err(RangingError::InvalidConfiguration(format!("unknown accessory {}", id)));
        }

        let scene = Arc::clone(&self.scene);
        let inputs = self.inputs.clone();
        let stream = tokio::spawn(async move {
            let send = |kind| inputs.send(RangingEvent { session, kind }.into()).is_ok();
            if !send(RangingEventKind::ShareableConfiguration(session.0.to_le_bytes().to_vec())) {
                return;
            }

            let mut interval = tokio::time::interval(Duration::from_millis(UPDATE_INTERVAL_MS));
            let mut converged = false;
            for round in 0u32.. {
                interval.tick().await;
                // Direction needs a few rounds to settle
                if !converged && round >= 5 {
                    converged = true;
                    if !send(RangingEventKind::ConvergenceChanged(true)) {
                        return;
                    }
                }
                let Some(update) = scene.measure(id) else {
                    return;
                };
                if !send(RangingEventKind::Update(update)) {
                    return;
                }
            }
        });
        if let Some(previous) = self.streams.insert(session, stream) {
            previous.abort();
        }
        Ok(())
    }

    fn invalidate(&mut self, session: SessionId) {
        if let Some(stream) = self.streams.remove(&session) {
            stream.abort();
        }
    }
}

impl Drop for SimulatedRanging {
    fn drop(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.abort();
        }
    }
}
