use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uwb_accessory_ranging::domain::models::{AppEvent, MessageSeverity};
use uwb_accessory_ranging::domain::settings::SettingsService;
use uwb_accessory_ranging::infrastructure::logging::init_logger;
use uwb_accessory_ranging::infrastructure::simulator::{
    Scene, SimulatedAccessory, SimulatedRanging, SimulatedTransport,
};
use uwb_accessory_ranging::{AccessoryService, ServiceCommand};

const DEMO_DURATION: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting UWB accessory ranging demo");

    // Write the effective settings back so every field shows up in the file
    if let Err(e) = settings_service.save() {
        warn!("Failed to save settings: {}", e);
    }

    // One simulated accessory per configured anchor
    let scene = Arc::new(Scene::new(
        settings
            .anchors
            .iter()
            .enumerate()
            .map(|(i, anchor)| SimulatedAccessory {
                id: anchor.id,
                name: format!("Anchor {}", i + 1),
                x: anchor.x,
                y: anchor.y,
            })
            .collect(),
    ));

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service = AccessoryService::new(
        SimulatedTransport::new(Arc::clone(&scene), input_tx.clone()),
        SimulatedRanging::new(scene, input_tx.clone()),
        &settings,
        event_tx,
    )?;
    let service_task = tokio::spawn(service.run(input_rx));

    input_tx.send(ServiceCommand::StartScanning.into())?;

    let deadline = tokio::time::sleep(DEMO_DURATION);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    input_tx.send(ServiceCommand::Shutdown.into())?;
    service_task.await?;
    while let Ok(event) = event_rx.try_recv() {
        log_event(&event);
    }

    info!("Demo finished");
    Ok(())
}

fn log_event(event: &AppEvent) {
    match event {
        AppEvent::DeviceDiscovered { id, name } => info!("Discovered {} ({})", name, id),
        AppEvent::DeviceRemoved(id) => info!("Removed {}", id),
        AppEvent::DeviceConnected(id) => info!("Connected {}", id),
        AppEvent::DeviceDisconnected(id) => info!("Disconnected {}", id),
        AppEvent::RangingStarted(id) => info!("Ranging started with {}", id),
        AppEvent::RangingStopped(id) => info!("Ranging stopped with {}", id),
        AppEvent::SessionStateChanged { id, session, state } => {
            info!("Session {} of {} is {:?}", session, id, state)
        }
        AppEvent::LocationUpdated {
            id,
            distance,
            azimuth_deg,
            elevation_deg,
            elevation,
            ..
        } => match (azimuth_deg, elevation_deg) {
            (Some(azimuth), Some(tilt)) => info!(
                "{}: {:.2} m, azimuth {:.0}°, elevation {:.0}°, {:?}",
                id, distance, azimuth, tilt, elevation
            ),
            _ => info!("{}: {:.2} m, {:?}", id, distance, elevation),
        },
        AppEvent::PositionUpdated { x, y } => info!("Position ({:.2}, {:.2})", x, y),
        AppEvent::ProtocolError { id, reason } => warn!("Protocol error from {}: {}", id, reason),
        AppEvent::TransportError { id, reason } => match id {
            Some(id) => warn!("Transport error on {}: {}", id, reason),
            None => warn!("Transport error: {}", reason),
        },
        AppEvent::ConfigurationError { id, reason } => {
            error!("Configuration error on {}: {}", id, reason)
        }
        AppEvent::LogMessage(status) => match status.severity {
            MessageSeverity::Error => error!("{}", status.message),
            MessageSeverity::Warning => warn!("{}", status.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", status.message),
        },
    }
}
