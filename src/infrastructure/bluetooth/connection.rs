//! BLE Connection Module
//!
//! Per-device link handling: connect, characteristic resolution, teardown,
//! reconnection and eviction. The driver is the only owner of the data
//! channel handles; everyone else writes through [`MessageSink`].

use crate::domain::errors::{DriverError, TransportError};
use crate::domain::models::{AppEvent, DeviceId, DeviceStatus, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::domain::session::MessageSink;
use crate::infrastructure::bluetooth::protocol::{ranging_service, transfer_service, HostMessage};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Discovered devices silent for longer than this are dropped
    pub eviction_timeout_ms: u64,
    /// Delay before reconnecting after a link is lost
    pub reconnect_delay_ms: u64,
    /// Give up on a connect attempt after this long
    pub connect_timeout_ms: u64,
    /// Connect automatically once this many devices are known
    pub auto_connect_min_devices: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            eviction_timeout_ms: 5000,
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            auto_connect_min_devices: Some(2),
        }
    }
}

/// Resolved data channels of one accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannels {
    /// Host → accessory
    pub rx: &'static str,
    /// Accessory → host
    pub tx: &'static str,
}

/// Pick the write and notify characteristics out of what the accessory
/// offers. Either service family is accepted.
pub fn resolve_channels(characteristics: &[String]) -> Result<DataChannels, TransportError> {
    let offered = |uuid: &str| characteristics.iter().any(|c| c.eq_ignore_ascii_case(uuid));

    let rx = [transfer_service::RX_CHAR_UUID, ranging_service::RX_CHAR_UUID]
        .into_iter()
        .find(|uuid| offered(uuid))
        .ok_or(TransportError::MissingCharacteristic("rx"))?;
    let tx = [transfer_service::TX_CHAR_UUID, ranging_service::TX_CHAR_UUID]
        .into_iter()
        .find(|uuid| offered(uuid))
        .ok_or(TransportError::MissingCharacteristic("tx"))?;

    Ok(DataChannels { rx, tx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    AwaitingCharacteristics,
    Open(DataChannels),
}

#[derive(Debug, Clone, Copy)]
struct Link {
    state: LinkState,
    since_ms: u64,
}

/// What the rest of the service has to react to after a transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    /// Both channels resolved, handshake can begin
    Ready(DeviceId),
    /// An open link went away
    Lost(DeviceId),
    /// Inbound frame on an open link
    Data(DeviceId, Vec<u8>),
}

pub struct ConnectionDriver<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    scanner: BleScanner,
    links: HashMap<DeviceId, Link>,
    /// Due time of each pending reconnection
    reconnects: BTreeMap<DeviceId, u64>,
    /// Devices the user disconnected; no automatic reconnection
    held: HashSet<DeviceId>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: Transport> ConnectionDriver<T> {
    pub fn new(
        transport: T,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            scanner: BleScanner::new(event_sender.clone()),
            links: HashMap::new(),
            reconnects: BTreeMap::new(),
            held: HashSet::new(),
            event_sender,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn link_state(&self, id: DeviceId) -> Option<LinkState> {
        self.links.get(&id).map(|link| link.state)
    }

    pub fn reconnect_due(&self, id: DeviceId) -> Option<u64> {
        self.reconnects.get(&id).copied()
    }

    pub fn start_scanning(&mut self) -> Result<(), TransportError> {
        self.scanner.start(&mut self.transport)
    }

    /// Stop scanning, drop every link and cancel pending reconnections.
    /// Returns the devices whose open link was dropped.
    pub fn stop_scanning(&mut self, registry: &mut DeviceRegistry, now_ms: u64) -> Vec<DeviceId> {
        if let Err(e) = self.scanner.stop(&mut self.transport) {
            warn!("Failed to stop scan: {}", e);
            self.report_transport_error(None, &e);
        }
        self.reconnects.clear();

        let ids: Vec<DeviceId> = self.links.keys().copied().collect();
        let mut lost = Vec::new();
        for id in ids {
            if let Err(e) = self.transport.disconnect(id) {
                warn!("Failed to disconnect {}: {}", id, e);
            }
            if self.drop_link(id, registry, now_ms, false) {
                lost.push(id);
            }
        }
        lost
    }

    /// Explicit connect. Clears a previous explicit disconnect.
    pub fn connect(
        &mut self,
        id: DeviceId,
        registry: &mut DeviceRegistry,
        now_ms: u64,
    ) -> Result<(), DriverError> {
        let status = registry.status(id).ok_or(DriverError::NoSuchDevice(id))?;
        self.held.remove(&id);
        if status != DeviceStatus::Discovered || self.links.contains_key(&id) {
            debug!("Connect to {} ignored, link already up", id);
            return Ok(());
        }
        self.begin_connect(id, now_ms)
    }

    /// Explicit disconnect. The device stays known but is not reconnected
    /// automatically. Returns true when an open link was dropped.
    pub fn disconnect(
        &mut self,
        id: DeviceId,
        registry: &mut DeviceRegistry,
        now_ms: u64,
    ) -> Result<bool, DriverError> {
        if !registry.contains(id) {
            return Err(DriverError::NoSuchDevice(id));
        }
        self.held.insert(id);
        self.reconnects.remove(&id);
        if !self.links.contains_key(&id) {
            return Ok(false);
        }

        info!("Disconnecting from accessory {}", id);
        if let Err(e) = self.transport.disconnect(id) {
            error!("Failed to disconnect {}: {}", id, e);
            self.report_transport_error(Some(id), &e);
        }
        Ok(self.drop_link(id, registry, now_ms, false))
    }

    /// Disconnect if needed and drop every trace of the device.
    /// Returns true when an open link was dropped.
    pub fn forget(
        &mut self,
        id: DeviceId,
        registry: &mut DeviceRegistry,
        now_ms: u64,
    ) -> Result<bool, DriverError> {
        let lost = self.disconnect(id, registry, now_ms)?;
        self.held.remove(&id);
        if registry.remove(id).is_some() {
            info!("Forgot accessory {}", id);
            self.send_event(AppEvent::DeviceRemoved(id));
        }
        Ok(lost)
    }

    /// Tear down a misbehaving link and go through the reconnection path.
    /// Returns true when an open link was dropped.
    pub fn abort(&mut self, id: DeviceId, registry: &mut DeviceRegistry, now_ms: u64) -> bool {
        if !self.links.contains_key(&id) {
            return false;
        }
        warn!("Aborting link to {}", id);
        if let Err(e) = self.transport.disconnect(id) {
            self.report_transport_error(Some(id), &e);
        }
        self.drop_link(id, registry, now_ms, true)
    }

    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        registry: &mut DeviceRegistry,
        now_ms: u64,
    ) -> Option<LinkChange> {
        match event {
            TransportEvent::Discovered { id, name } => {
                if !self.scanner.is_scanning() {
                    return None;
                }
                self.scanner.record(registry, id, &name, now_ms);
                self.auto_connect(registry, now_ms);
                None
            }
            TransportEvent::Connected(id) => {
                let link = self.links.get_mut(&id)?;
                if link.state != LinkState::Connecting {
                    return None;
                }
                link.state = LinkState::AwaitingCharacteristics;
                debug!("Link to {} up, discovering characteristics", id);
                if let Err(e) = self.transport.discover_characteristics(id) {
                    self.fail_link(id, &e, registry, now_ms);
                }
                None
            }
            TransportEvent::ConnectFailed { id, reason } => {
                if !self.links.contains_key(&id) {
                    return None;
                }
                self.fail_link(id, &TransportError::ConnectFailed(reason), registry, now_ms);
                None
            }
            TransportEvent::CharacteristicsDiscovered {
                id,
                characteristics,
            } => {
                if self.link_state(id) != Some(LinkState::AwaitingCharacteristics) {
                    return None;
                }
                match self.open_channels(id, &characteristics) {
                    Ok(channels) => {
                        if let Some(link) = self.links.get_mut(&id) {
                            link.state = LinkState::Open(channels);
                        }
                        let _ = registry.set_status(id, DeviceStatus::Connected);
                        let _ = registry.touch(id, now_ms);
                        info!("Accessory {} connected", id);
                        self.send_event(AppEvent::DeviceConnected(id));
                        Some(LinkChange::Ready(id))
                    }
                    Err(e) => {
                        let _ = self.transport.disconnect(id);
                        self.fail_link(id, &e, registry, now_ms);
                        None
                    }
                }
            }
            TransportEvent::Disconnected { id, reason } => {
                if !self.links.contains_key(&id) {
                    return None;
                }
                match &reason {
                    Some(reason) => warn!("Accessory {} disconnected: {}", id, reason),
                    None => info!("Accessory {} disconnected", id),
                }
                self.drop_link(id, registry, now_ms, true)
                    .then_some(LinkChange::Lost(id))
            }
            TransportEvent::Data { id, bytes } => match self.link_state(id) {
                Some(LinkState::Open(_)) => Some(LinkChange::Data(id, bytes)),
                _ => {
                    debug!("Dropping {} bytes from {} without open link", bytes.len(), id);
                    None
                }
            },
        }
    }

    /// Periodic work: connect timeouts, due reconnections and eviction.
    /// Eviction pauses while not scanning, since no advertisement can
    /// refresh a device then.
    pub fn tick(&mut self, registry: &mut DeviceRegistry, now_ms: u64) {
        let timed_out: Vec<DeviceId> = self
            .links
            .iter()
            .filter(|(_, link)| !matches!(link.state, LinkState::Open(_)))
            .filter(|(_, link)| now_ms.saturating_sub(link.since_ms) > self.config.connect_timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            let _ = self.transport.disconnect(id);
            let e = TransportError::ConnectTimeout(self.config.connect_timeout_ms);
            self.fail_link(id, &e, registry, now_ms);
        }

        let due: Vec<DeviceId> = self
            .reconnects
            .iter()
            .filter(|(_, due)| **due <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.reconnects.remove(&id);
            if registry.status(id) == Some(DeviceStatus::Discovered) && !self.links.contains_key(&id)
            {
                info!("Reconnecting to accessory {}", id);
                let _ = self.begin_connect(id, now_ms);
            }
        }

        if !self.scanner.is_scanning() {
            return;
        }
        let links = &self.links;
        let expired = self.scanner.expired(
            registry,
            now_ms,
            self.config.eviction_timeout_ms,
            |id| links.contains_key(&id),
        );
        for id in expired {
            registry.remove(id);
            self.reconnects.remove(&id);
            self.held.remove(&id);
            info!("Accessory {} evicted", id);
            self.send_event(AppEvent::DeviceRemoved(id));
        }
    }

    fn auto_connect(&mut self, registry: &mut DeviceRegistry, now_ms: u64) {
        let Some(min_devices) = self.config.auto_connect_min_devices else {
            return;
        };
        if registry.len() < min_devices {
            return;
        }
        for id in registry.ids_with_status(DeviceStatus::Discovered) {
            if self.links.contains_key(&id)
                || self.held.contains(&id)
                || self.reconnects.contains_key(&id)
            {
                continue;
            }
            let _ = self.begin_connect(id, now_ms);
        }
    }

    fn begin_connect(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        info!("Connecting to accessory {}", id);
        self.reconnects.remove(&id);
        if let Err(e) = self.transport.connect(id) {
            error!("Connect to {} failed: {}", id, e);
            self.report_transport_error(Some(id), &e);
            self.schedule_reconnect(id, now_ms);
            return Err(e.into());
        }
        self.links.insert(
            id,
            Link {
                state: LinkState::Connecting,
                since_ms: now_ms,
            },
        );
        Ok(())
    }

    fn open_channels(
        &mut self,
        id: DeviceId,
        characteristics: &[String],
    ) -> Result<DataChannels, TransportError> {
        let channels = resolve_channels(characteristics)?;
        self.transport.subscribe(id, channels.tx)?;
        Ok(channels)
    }

    /// A link that never opened failed. Report it and try again later.
    fn fail_link(
        &mut self,
        id: DeviceId,
        e: &TransportError,
        registry: &mut DeviceRegistry,
        now_ms: u64,
    ) {
        warn!("Link to {} failed: {}", id, e);
        self.report_transport_error(Some(id), e);
        self.drop_link(id, registry, now_ms, true);
    }

    /// Forget the link and put the device back to Discovered. Returns true
    /// when the link had been open.
    fn drop_link(
        &mut self,
        id: DeviceId,
        registry: &mut DeviceRegistry,
        now_ms: u64,
        reconnect: bool,
    ) -> bool {
        let Some(link) = self.links.remove(&id) else {
            return false;
        };
        let was_open = matches!(link.state, LinkState::Open(_));

        if registry.contains(id) {
            let _ = registry.set_status(id, DeviceStatus::Discovered);
            if was_open {
                let _ = registry.touch(id, now_ms);
                self.send_event(AppEvent::DeviceDisconnected(id));
            }
            if reconnect {
                self.schedule_reconnect(id, now_ms);
            }
        }
        was_open
    }

    fn schedule_reconnect(&mut self, id: DeviceId, now_ms: u64) {
        if !self.scanner.is_scanning() || self.held.contains(&id) {
            return;
        }
        let due = now_ms + self.config.reconnect_delay_ms;
        debug!("Reconnect to {} scheduled at {}ms", id, due);
        self.reconnects.insert(id, due);
    }

    fn report_transport_error(&self, id: Option<DeviceId>, e: &TransportError) {
        self.send_event(AppEvent::TransportError {
            id,
            reason: e.to_string(),
        });
        self.send_event(AppEvent::LogMessage(StatusMessage {
            message: match id {
                Some(id) => format!("Accessory {}: {}", id, e),
                None => e.to_string(),
            },
            severity: MessageSeverity::Error,
        }));
    }

    fn send_event(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl<T: Transport> MessageSink for ConnectionDriver<T> {
    fn send_message(&mut self, id: DeviceId, message: &HostMessage) -> Result<(), DriverError> {
        let channels = match self.link_state(id) {
            Some(LinkState::Open(channels)) => channels,
            _ => return Err(DriverError::NotConnected(id)),
        };
        debug!("Sending {:?} to {}", message.id(), id);
        self.transport
            .write(id, channels.rx, &message.encode())
            .map_err(DriverError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Device;

    #[derive(Default)]
    struct ScriptedTransport {
        calls: Vec<String>,
        writes: Vec<(DeviceId, String, Vec<u8>)>,
        refuse_connect: bool,
    }

    impl Transport for ScriptedTransport {
        fn start_scan(&mut self, _: &[&str]) -> Result<(), TransportError> {
            self.calls.push("start_scan".into());
            Ok(())
        }
        fn stop_scan(&mut self) -> Result<(), TransportError> {
            self.calls.push("stop_scan".into());
            Ok(())
        }
        fn connect(&mut self, id: DeviceId) -> Result<(), TransportError> {
            self.calls.push(format!("connect {}", id));
            if self.refuse_connect {
                return Err(TransportError::ConnectFailed("radio off".into()));
            }
            Ok(())
        }
        fn discover_characteristics(&mut self, id: DeviceId) -> Result<(), TransportError> {
            self.calls.push(format!("discover {}", id));
            Ok(())
        }
        fn subscribe(&mut self, id: DeviceId, characteristic: &str) -> Result<(), TransportError> {
            self.calls.push(format!("subscribe {} {}", id, characteristic));
            Ok(())
        }
        fn write(&mut self, id: DeviceId, characteristic: &str, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.push((id, characteristic.to_string(), bytes.to_vec()));
            Ok(())
        }
        fn disconnect(&mut self, id: DeviceId) -> Result<(), TransportError> {
            self.calls.push(format!("disconnect {}", id));
            Ok(())
        }
    }

    fn driver(auto: Option<usize>) -> (ConnectionDriver<ScriptedTransport>, DeviceRegistry, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            auto_connect_min_devices: auto,
            ..ConnectionConfig::default()
        };
        let mut driver = ConnectionDriver::new(ScriptedTransport::default(), config, tx);
        driver.start_scanning().unwrap();
        (driver, DeviceRegistry::new(), rx)
    }

    fn transfer_characteristics() -> Vec<String> {
        vec![
            transfer_service::RX_CHAR_UUID.to_uppercase(),
            transfer_service::TX_CHAR_UUID.to_string(),
        ]
    }

    fn open(driver: &mut ConnectionDriver<ScriptedTransport>, registry: &mut DeviceRegistry, id: DeviceId) {
        driver.handle_transport_event(TransportEvent::Connected(id), registry, 0);
        let change = driver.handle_transport_event(
            TransportEvent::CharacteristicsDiscovered {
                id,
                characteristics: transfer_characteristics(),
            },
            registry,
            0,
        );
        assert_eq!(change, Some(LinkChange::Ready(id)));
    }

    fn discovered(id: u64) -> TransportEvent {
        TransportEvent::Discovered {
            id: DeviceId(id),
            name: format!("Tag{}", id),
        }
    }

    #[test]
    fn test_resolve_channels_either_family() {
        let channels = resolve_channels(&transfer_characteristics()).unwrap();
        assert_eq!(channels.rx, transfer_service::RX_CHAR_UUID);
        assert_eq!(channels.tx, transfer_service::TX_CHAR_UUID);

        let channels = resolve_channels(&[
            ranging_service::TX_CHAR_UUID.to_string(),
            ranging_service::RX_CHAR_UUID.to_string(),
            ranging_service::SC_CHAR_UUID.to_string(),
        ])
        .unwrap();
        assert_eq!(channels.rx, ranging_service::RX_CHAR_UUID);

        assert_eq!(
            resolve_channels(&[transfer_service::RX_CHAR_UUID.to_string()]),
            Err(TransportError::MissingCharacteristic("tx"))
        );
    }

    #[test]
    fn test_auto_connect_waits_for_enough_devices() {
        let (mut driver, mut registry, _rx) = driver(Some(2));
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        assert_eq!(driver.link_state(DeviceId(1)), None);

        driver.handle_transport_event(discovered(2), &mut registry, 10);
        assert_eq!(driver.link_state(DeviceId(1)), Some(LinkState::Connecting));
        assert_eq!(driver.link_state(DeviceId(2)), Some(LinkState::Connecting));
        assert_eq!(registry.status(DeviceId(1)), Some(DeviceStatus::Discovered));
    }

    #[test]
    fn test_missing_characteristic_disconnects() {
        let (mut driver, mut registry, mut rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        driver.handle_transport_event(TransportEvent::Connected(DeviceId(1)), &mut registry, 0);
        let change = driver.handle_transport_event(
            TransportEvent::CharacteristicsDiscovered {
                id: DeviceId(1),
                characteristics: vec![transfer_service::TX_CHAR_UUID.to_string()],
            },
            &mut registry,
            0,
        );

        assert_eq!(change, None);
        assert_eq!(driver.link_state(DeviceId(1)), None);
        assert_eq!(registry.status(DeviceId(1)), Some(DeviceStatus::Discovered));
        assert!(driver.transport().calls.contains(&"disconnect 1".to_string()));
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            saw_error |= matches!(event, AppEvent::TransportError { id: Some(DeviceId(1)), .. });
        }
        assert!(saw_error);
    }

    #[test]
    fn test_disconnect_schedules_reconnect() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        open(&mut driver, &mut registry, DeviceId(1));
        assert_eq!(registry.status(DeviceId(1)), Some(DeviceStatus::Connected));

        let change = driver.handle_transport_event(
            TransportEvent::Disconnected {
                id: DeviceId(1),
                reason: Some("link loss".into()),
            },
            &mut registry,
            2000,
        );
        assert_eq!(change, Some(LinkChange::Lost(DeviceId(1))));
        assert_eq!(registry.status(DeviceId(1)), Some(DeviceStatus::Discovered));
        assert_eq!(driver.reconnect_due(DeviceId(1)), Some(3000));

        driver.tick(&mut registry, 2999);
        assert_eq!(driver.link_state(DeviceId(1)), None);
        driver.tick(&mut registry, 3000);
        assert_eq!(driver.link_state(DeviceId(1)), Some(LinkState::Connecting));
    }

    #[test]
    fn test_explicit_disconnect_holds_device() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        open(&mut driver, &mut registry, DeviceId(1));

        assert_eq!(driver.disconnect(DeviceId(1), &mut registry, 100), Ok(true));
        assert_eq!(driver.reconnect_due(DeviceId(1)), None);

        // The late callback from the radio is a no-op
        let change = driver.handle_transport_event(
            TransportEvent::Disconnected {
                id: DeviceId(1),
                reason: None,
            },
            &mut registry,
            120,
        );
        assert_eq!(change, None);
        assert_eq!(
            driver.disconnect(DeviceId(9), &mut registry, 100),
            Err(DriverError::NoSuchDevice(DeviceId(9)))
        );
    }

    #[test]
    fn test_eviction_happens_once() {
        let (mut driver, mut registry, mut rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);

        driver.tick(&mut registry, 5000);
        assert!(registry.contains(DeviceId(1)));
        driver.tick(&mut registry, 5001);
        driver.tick(&mut registry, 5201);
        assert!(!registry.contains(DeviceId(1)));

        let mut removed = 0;
        while let Ok(event) = rx.try_recv() {
            if event == AppEvent::DeviceRemoved(DeviceId(1)) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_connecting_device_is_not_evicted() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 4000).unwrap();
        driver.tick(&mut registry, 6000);
        assert!(registry.contains(DeviceId(1)));
    }

    #[test]
    fn test_connect_timeout() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        driver.handle_transport_event(discovered(1), &mut registry, 9000);

        driver.tick(&mut registry, 10_001);
        assert_eq!(driver.link_state(DeviceId(1)), None);
        assert_eq!(driver.reconnect_due(DeviceId(1)), Some(11_001));
    }

    #[test]
    fn test_connect_failure_is_reported_and_retried() {
        let (mut driver, mut registry, _rx) = driver(None);
        registry.upsert(Device::new(DeviceId(1), "a", 0));
        driver.transport.refuse_connect = true;

        let result = driver.connect(DeviceId(1), &mut registry, 0);
        assert!(matches!(result, Err(DriverError::Transport(_))));
        assert_eq!(driver.reconnect_due(DeviceId(1)), Some(1000));
        assert_eq!(
            driver.connect(DeviceId(5), &mut registry, 0),
            Err(DriverError::NoSuchDevice(DeviceId(5)))
        );
    }

    #[test]
    fn test_send_requires_open_link() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        assert_eq!(
            driver.send_message(DeviceId(1), &HostMessage::Initialize),
            Err(DriverError::NotConnected(DeviceId(1)))
        );

        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        open(&mut driver, &mut registry, DeviceId(1));
        driver.send_message(DeviceId(1), &HostMessage::Initialize).unwrap();
        assert_eq!(
            driver.transport().writes,
            vec![(DeviceId(1), transfer_service::RX_CHAR_UUID.to_string(), vec![0x0A])]
        );
    }

    #[test]
    fn test_stop_scanning_drops_links_and_timers() {
        let (mut driver, mut registry, _rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.handle_transport_event(discovered(2), &mut registry, 0);
        driver.connect(DeviceId(1), &mut registry, 0).unwrap();
        open(&mut driver, &mut registry, DeviceId(1));
        driver.connect(DeviceId(2), &mut registry, 0).unwrap();
        driver.handle_transport_event(
            TransportEvent::ConnectFailed {
                id: DeviceId(2),
                reason: "busy".into(),
            },
            &mut registry,
            10,
        );
        assert!(driver.reconnect_due(DeviceId(2)).is_some());

        let lost = driver.stop_scanning(&mut registry, 20);
        assert_eq!(lost, vec![DeviceId(1)]);
        assert!(!driver.is_scanning());
        assert_eq!(driver.reconnect_due(DeviceId(2)), None);
        assert_eq!(registry.status(DeviceId(1)), Some(DeviceStatus::Discovered));

        // Stopping twice is harmless
        assert!(driver.stop_scanning(&mut registry, 30).is_empty());
    }

    #[test]
    fn test_no_eviction_while_stopped() {
        let (mut driver, mut registry, mut rx) = driver(None);
        driver.handle_transport_event(discovered(1), &mut registry, 0);
        driver.stop_scanning(&mut registry, 10);
        while rx.try_recv().is_ok() {}

        driver.tick(&mut registry, 60_000);
        assert!(registry.contains(DeviceId(1)));
        assert!(rx.try_recv().is_err());

        // Scanning again resumes eviction
        driver.start_scanning().unwrap();
        driver.tick(&mut registry, 60_001);
        assert!(!registry.contains(DeviceId(1)));
    }
}
