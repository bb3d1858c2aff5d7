//! BLE Scanner Module
//!
//! Handles accessory discovery: scan on/off and the bookkeeping of which
//! advertisements have been seen and when.

use crate::domain::errors::TransportError;
use crate::domain::models::{AppEvent, Device, DeviceId, DeviceStatus, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::protocol::SCAN_SERVICE_UUIDS;
use crate::infrastructure::bluetooth::transport::Transport;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// BLE Scanner for discovering ranging accessories
pub struct BleScanner {
    scanning: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            scanning: false,
            event_sender,
        }
    }

    /// Start scanning for accessories of both service families.
    /// Calling it while already scanning does nothing.
    pub fn start(&mut self, transport: &mut impl Transport) -> Result<(), TransportError> {
        if self.scanning {
            return Ok(());
        }

        info!("Starting BLE scan for services: {:?}", SCAN_SERVICE_UUIDS);
        self.send_log("Scanning for accessories...", MessageSeverity::Info);

        transport.start_scan(SCAN_SERVICE_UUIDS)?;
        self.scanning = true;
        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self, transport: &mut impl Transport) -> Result<(), TransportError> {
        if !self.scanning {
            return Ok(());
        }

        info!("Stopping BLE scan...");
        self.send_log("Scan stopped.", MessageSeverity::Info);
        self.scanning = false;
        transport.stop_scan()
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record an advertisement. Returns true when the device is new.
    pub fn record(
        &self,
        registry: &mut DeviceRegistry,
        id: DeviceId,
        name: &str,
        now_ms: u64,
    ) -> bool {
        if registry.contains(id) {
            let _ = registry.touch(id, now_ms);
            return false;
        }

        let device = Device::new(id, name, now_ms);
        info!("Discovered accessory {} ({})", device.name, id);
        let _ = self.event_sender.send(AppEvent::DeviceDiscovered {
            id,
            name: device.name.clone(),
        });
        registry.upsert(device)
    }

    /// Discovered devices that have not advertised for longer than
    /// `timeout_ms`. Devices for which `in_flight` holds are skipped.
    pub fn expired(
        &self,
        registry: &DeviceRegistry,
        now_ms: u64,
        timeout_ms: u64,
        in_flight: impl Fn(DeviceId) -> bool,
    ) -> Vec<DeviceId> {
        registry
            .all()
            .filter(|device| device.status == DeviceStatus::Discovered)
            .filter(|device| now_ms.saturating_sub(device.last_seen_ms) > timeout_ms)
            .filter(|device| !in_flight(device.id))
            .map(|device| {
                debug!(
                    "Accessory {} silent for {}ms",
                    device.id,
                    now_ms.saturating_sub(device.last_seen_ms)
                );
                device.id
            })
            .collect()
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
