//! Accessory Service Module
//!
//! Main service that coordinates discovery, connections, the handshake,
//! ranging sessions and positioning. All state lives in one task; inputs
//! are processed one at a time so per-device transitions never interleave.

use crate::domain::errors::{DriverError, PositionError, ProtocolError, TransportError};
use crate::domain::models::{AppEvent, DeviceId, MessageSeverity, StatusMessage};
use crate::domain::positioning::PositionEngine;
use crate::domain::registry::DeviceRegistry;
use crate::domain::retry;
use crate::domain::session::{MessageSink, SessionContext, SessionManager};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionDriver, LinkChange};
use crate::infrastructure::bluetooth::protocol::{self, HostMessage};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use crate::infrastructure::ranging::{RangingCapability, RangingEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Requests from the application
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCommand {
    StartScanning,
    StopScanning,
    Connect(DeviceId),
    Disconnect(DeviceId),
    Forget(DeviceId),
    Send(DeviceId, HostMessage),
    RestartRanging(DeviceId),
    Shutdown,
}

/// Everything the service loop consumes
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceInput {
    Command(ServiceCommand),
    Transport(TransportEvent),
    Ranging(RangingEvent),
}

impl From<ServiceCommand> for ServiceInput {
    fn from(command: ServiceCommand) -> Self {
        Self::Command(command)
    }
}

impl From<TransportEvent> for ServiceInput {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

impl From<RangingEvent> for ServiceInput {
    fn from(event: RangingEvent) -> Self {
        Self::Ranging(event)
    }
}

/// Main service coordinating all accessory operations
pub struct AccessoryService<T: Transport, R: RangingCapability> {
    registry: DeviceRegistry,
    driver: ConnectionDriver<T>,
    sessions: SessionManager<R>,
    positioning: PositionEngine,
    tick_interval_ms: u64,
    location_stale_after_ms: u64,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: Transport, R: RangingCapability> AccessoryService<T, R> {
    /// Create a new service. Fails when the configured anchors are unusable.
    pub fn new(
        transport: T,
        capability: R,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self, PositionError> {
        let anchors = settings.anchor_table()?;
        let config = ConnectionConfig {
            eviction_timeout_ms: settings.eviction_timeout_ms,
            reconnect_delay_ms: settings.reconnect_delay_ms,
            connect_timeout_ms: settings.connect_timeout_ms,
            auto_connect_min_devices: settings.auto_connect_min_devices,
        };

        Ok(Self {
            registry: DeviceRegistry::new(),
            driver: ConnectionDriver::new(transport, config, event_sender.clone()),
            sessions: SessionManager::new(
                capability,
                retry::from_settings(settings.retry_max_attempts),
                settings.direction_enabled,
                event_sender.clone(),
            ),
            positioning: PositionEngine::new(anchors),
            tick_interval_ms: settings.tick_interval_ms.max(1),
            location_stale_after_ms: settings.location_stale_after_ms,
            event_sender,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &ConnectionDriver<T> {
        &self.driver
    }

    pub fn sessions(&self) -> &SessionManager<R> {
        &self.sessions
    }

    /// Start scanning for devices
    pub fn start_scanning(&mut self) -> Result<(), TransportError> {
        self.driver.start_scanning().inspect_err(|e| {
            warn!("Failed to start scan: {}", e);
            self.send_event(AppEvent::TransportError {
                id: None,
                reason: e.to_string(),
            });
        })
    }

    /// Stop scanning and disconnect everything
    pub fn stop_scanning(&mut self, now_ms: u64) {
        for id in self.driver.stop_scanning(&mut self.registry, now_ms) {
            self.sessions.cancel(id);
        }
    }

    pub fn connect(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        self.driver.connect(id, &mut self.registry, now_ms)
    }

    pub fn disconnect(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        if self.driver.disconnect(id, &mut self.registry, now_ms)? {
            self.sessions.cancel(id);
        }
        Ok(())
    }

    pub fn forget_device(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        if self.driver.forget(id, &mut self.registry, now_ms)? {
            self.sessions.cancel(id);
        }
        Ok(())
    }

    pub fn send_to_device(&mut self, id: DeviceId, message: &HostMessage) -> Result<(), DriverError> {
        if !self.registry.contains(id) {
            return Err(DriverError::NoSuchDevice(id));
        }
        self.driver.send_message(id, message)
    }

    pub fn restart_ranging(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        let (sessions, mut ctx) = self.session_context(now_ms);
        sessions.restart_ranging(id, &mut ctx)
    }

    /// Decode and dispatch one frame from an accessory.
    pub fn received_from_device(&mut self, id: DeviceId, bytes: &[u8], now_ms: u64) {
        if !self.registry.contains(id) {
            debug!("Dropping frame from unknown device {}", id);
            return;
        }

        match protocol::decode_from_accessory(bytes) {
            Ok(message) => {
                debug!("Received {:?} from {}", message.id(), id);
                let (sessions, mut ctx) = self.session_context(now_ms);
                if sessions.handle_message(id, message, &mut ctx) {
                    self.driver.abort(id, &mut self.registry, now_ms);
                }
            }
            Err(ProtocolError::Empty) => {
                warn!("Empty frame from {}", id);
                self.report_protocol_error(id, &ProtocolError::Empty);
            }
            Err(e) => {
                warn!("Protocol error from {}: {}", id, e);
                self.report_protocol_error(id, &e);
                if self.driver.abort(id, &mut self.registry, now_ms) {
                    self.sessions.cancel(id);
                }
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now_ms: u64) {
        let change = self
            .driver
            .handle_transport_event(event, &mut self.registry, now_ms);
        match change {
            Some(LinkChange::Ready(id)) => {
                let (sessions, mut ctx) = self.session_context(now_ms);
                sessions.start(id, &mut ctx);
            }
            Some(LinkChange::Lost(id)) => {
                self.sessions.cancel(id);
            }
            Some(LinkChange::Data(id, bytes)) => self.received_from_device(id, &bytes, now_ms),
            None => {}
        }
    }

    pub fn handle_ranging_event(&mut self, event: RangingEvent, now_ms: u64) {
        let (sessions, mut ctx) = self.session_context(now_ms);
        if sessions.handle_ranging_event(event, &mut ctx) {
            self.update_position();
        }
    }

    /// Periodic housekeeping
    pub fn tick(&mut self, now_ms: u64) {
        self.driver.tick(&mut self.registry, now_ms);
        self.sessions
            .expire_locations(&mut self.registry, now_ms, self.location_stale_after_ms);
        let (sessions, mut ctx) = self.session_context(now_ms);
        sessions.send_liveness_pings(&mut ctx);
    }

    /// Returns false once the service should stop.
    pub fn handle_input(&mut self, input: ServiceInput, now_ms: u64) -> bool {
        match input {
            ServiceInput::Command(command) => return self.handle_command(command, now_ms),
            ServiceInput::Transport(event) => self.handle_transport_event(event, now_ms),
            ServiceInput::Ranging(event) => self.handle_ranging_event(event, now_ms),
        }
        true
    }

    /// Run the event loop until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<ServiceInput>) {
        let started = Instant::now();
        let now_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut ticker = tokio::time::interval(Duration::from_millis(self.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Accessory service running");
        loop {
            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle_input(input, now_ms()) {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick(now_ms()),
            }
        }

        self.stop_scanning(now_ms());
        info!("Accessory service stopped");
    }

    fn handle_command(&mut self, command: ServiceCommand, now_ms: u64) -> bool {
        let result = match command {
            ServiceCommand::StartScanning => self.start_scanning().map_err(DriverError::from),
            ServiceCommand::StopScanning => {
                self.stop_scanning(now_ms);
                Ok(())
            }
            ServiceCommand::Connect(id) => self.connect(id, now_ms),
            ServiceCommand::Disconnect(id) => self.disconnect(id, now_ms),
            ServiceCommand::Forget(id) => self.forget_device(id, now_ms),
            ServiceCommand::Send(id, message) => self.send_to_device(id, &message),
            ServiceCommand::RestartRanging(id) => self.restart_ranging(id, now_ms),
            ServiceCommand::Shutdown => return false,
        };

        if let Err(e) = result {
            warn!("Command failed: {}", e);
            self.send_log(&e.to_string(), MessageSeverity::Error);
        }
        true
    }

    fn update_position(&mut self) {
        match self.positioning.locate(&self.registry) {
            Ok(fix) => {
                if fix.clamped {
                    debug!("Anchor circles do not intersect, fix clamped to baseline");
                }
                self.send_event(AppEvent::PositionUpdated { x: fix.x, y: fix.y });
            }
            Err(PositionError::InsufficientAnchors { .. }) => {}
            Err(e) => warn!("Position not computed: {}", e),
        }
    }

    fn session_context(&mut self, now_ms: u64) -> (&mut SessionManager<R>, SessionContext<'_>) {
        (
            &mut self.sessions,
            SessionContext {
                registry: &mut self.registry,
                sink: &mut self.driver,
                now_ms,
            },
        )
    }

    fn report_protocol_error(&self, id: DeviceId, e: &ProtocolError) {
        self.send_event(AppEvent::ProtocolError {
            id,
            reason: e.to_string(),
        });
    }

    fn send_event(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.send_event(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
