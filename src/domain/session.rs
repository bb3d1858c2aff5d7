//! Ranging Session Manager
//!
//! Owns one [`RangingSession`] per connected accessory and drives it through
//!
//! ```text
//! Initializing ──RangingStarted──► Running ◄──┐
//!      ▲                              │       │ SuspensionEnded (via Initializing)
//!      │ timeout / recoverable error  ▼       │
//!      └──────────────────────────  Suspended ┘
//!
//! any ──terminal error / no retry──► Invalidated
//! ```
//!
//! Outbound messages go through a [`MessageSink`]; send failures are reported
//! and never roll a transition back.

use crate::domain::errors::{DriverError, RangingError};
use crate::domain::models::{
    AppEvent, DeviceId, DeviceStatus, MessageSeverity, SessionId, SessionState, StatusMessage,
};
use crate::domain::positioning::{azimuth, direction_from_horizontal_angle, elevation};
use crate::domain::registry::DeviceRegistry;
use crate::domain::retry::RetryPolicy;
use crate::infrastructure::bluetooth::protocol::{AccessoryMessage, HostMessage};
use crate::infrastructure::ranging::{
    NearbyUpdate, RangingCapability, RangingEvent, RangingEventKind, RemovalReason,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound half of an accessory link.
pub trait MessageSink {
    fn send_message(&mut self, id: DeviceId, message: &HostMessage) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangingSession {
    pub id: SessionId,
    pub device: DeviceId,
    pub state: SessionState,
    pub retry_count: u32,
    pub converged: bool,
}

/// Mutable state a handler needs besides the sessions themselves.
pub struct SessionContext<'a> {
    pub registry: &'a mut DeviceRegistry,
    pub sink: &'a mut dyn MessageSink,
    pub now_ms: u64,
}

pub struct SessionManager<R: RangingCapability> {
    capability: R,
    retry_policy: Box<dyn RetryPolicy>,
    sessions: HashMap<SessionId, RangingSession>,
    by_device: HashMap<DeviceId, SessionId>,
    next_session: u64,
    direction_enabled: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<R: RangingCapability> SessionManager<R> {
    pub fn new(
        capability: R,
        retry_policy: Box<dyn RetryPolicy>,
        direction_enabled: bool,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            capability,
            retry_policy,
            sessions: HashMap::new(),
            by_device: HashMap::new(),
            next_session: 1,
            direction_enabled,
            event_sender,
        }
    }

    pub fn session_for(&self, id: DeviceId) -> Option<&RangingSession> {
        self.by_device.get(&id).and_then(|sid| self.sessions.get(sid))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capability(&self) -> &R {
        &self.capability
    }

    /// Open a session for a device whose data channels just came up.
    /// Any previous session of the device is discarded first.
    pub fn start(&mut self, id: DeviceId, ctx: &mut SessionContext<'_>) {
        self.discard(id);
        self.open(id, 0, ctx);
    }

    /// Explicit recovery, typically after a terminal invalidation.
    pub fn restart_ranging(
        &mut self,
        id: DeviceId,
        ctx: &mut SessionContext<'_>,
    ) -> Result<(), DriverError> {
        match ctx.registry.status(id) {
            None => Err(DriverError::NoSuchDevice(id)),
            Some(DeviceStatus::Discovered) => Err(DriverError::NotConnected(id)),
            Some(_) => {
                if self.session_for(id).is_some_and(|s| s.state != SessionState::Invalidated) {
                    self.send(id, &HostMessage::Stop, ctx);
                }
                self.settle_device(id, ctx);
                self.discard(id);
                self.open(id, 0, ctx);
                Ok(())
            }
        }
    }

    /// Drop the session of a device whose link went away. Nothing is sent.
    pub fn cancel(&mut self, id: DeviceId) -> bool {
        if self.session_for(id).map(|s| s.state) == Some(SessionState::Running) {
            self.send_event(AppEvent::RangingStopped(id));
        }
        match self.discard(id) {
            Some(session) => {
                info!("Device {} disconnected; session {} invalidated", id, session.id);
                true
            }
            None => false,
        }
    }

    /// Handle one decoded accessory message. Returns true when the accessory
    /// ended a running session on its own; the session is gone and the link
    /// has to be dropped.
    pub fn handle_message(
        &mut self,
        id: DeviceId,
        message: AccessoryMessage,
        ctx: &mut SessionContext<'_>,
    ) -> bool {
        match message {
            AccessoryMessage::ConfigurationData(payload) => {
                self.on_configuration_data(id, &payload, ctx)
            }
            AccessoryMessage::RangingStarted => self.on_ranging_started(id, ctx),
            AccessoryMessage::RangingStopped => return self.on_ranging_stopped(id, ctx),
            AccessoryMessage::GetReserved(payload)
            | AccessoryMessage::SetReserved(payload)
            | AccessoryMessage::Notify(payload) => {
                debug!("Reserved message from {}: {} bytes", id, payload.len());
            }
        }
        false
    }

    /// Handle one callback from the ranging subsystem. Returns true when a
    /// location was written to the registry.
    pub fn handle_ranging_event(
        &mut self,
        event: RangingEvent,
        ctx: &mut SessionContext<'_>,
    ) -> bool {
        let Some(session) = self.sessions.get(&event.session) else {
            debug!("Ignoring {:?} for unknown session {}", event.kind, event.session);
            return false;
        };
        let (sid, id, state) = (session.id, session.device, session.state);
        if !ctx.registry.contains(id) {
            debug!("Ignoring ranging event for removed device {}", id);
            return false;
        }
        // Only restart_ranging brings an invalidated session back
        if state == SessionState::Invalidated {
            debug!("Ignoring {:?} for invalidated session {}", event.kind, sid);
            return false;
        }

        match event.kind {
            RangingEventKind::ShareableConfiguration(blob) => {
                self.send(id, &HostMessage::ConfigureAndStart(blob), ctx);
                false
            }
            RangingEventKind::Update(update) => self.on_update(sid, id, update, ctx),
            RangingEventKind::ConvergenceChanged(converged) => {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.converged = converged;
                }
                false
            }
            RangingEventKind::Removed(reason) => {
                self.on_removed(sid, id, reason, ctx);
                false
            }
            RangingEventKind::Suspended => {
                self.send(id, &HostMessage::Stop, ctx);
                self.settle_device(id, ctx);
                self.transition(sid, SessionState::Suspended);
                false
            }
            RangingEventKind::SuspensionEnded => {
                if state != SessionState::Suspended {
                    debug!("Session {} was not suspended ({:?})", sid, state);
                    return false;
                }
                self.send(id, &HostMessage::Initialize, ctx);
                self.transition(sid, SessionState::Initializing);
                false
            }
            RangingEventKind::Invalidated(error) => {
                self.on_invalidated(sid, id, error, ctx);
                false
            }
        }
    }

    /// Mark readings older than `stale_after_ms` as stale.
    pub fn expire_locations(&self, registry: &mut DeviceRegistry, now_ms: u64, stale_after_ms: u64) {
        let expired: Vec<DeviceId> = registry
            .all()
            .filter(|device| {
                device.location.as_ref().is_some_and(|location| {
                    !location.stale && now_ms.saturating_sub(location.updated_ms) > stale_after_ms
                })
            })
            .map(|device| device.id)
            .collect();
        for id in expired {
            debug!("Location of {} went stale", id);
            let _ = registry.mark_stale(id);
        }
    }

    /// Send a `Notify` ping to every device with a running session.
    pub fn send_liveness_pings(&mut self, ctx: &mut SessionContext<'_>) {
        let running: Vec<DeviceId> = self
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Running)
            .map(|s| s.device)
            .collect();
        for id in running {
            self.send(id, &HostMessage::Notify(Vec::new()), ctx);
        }
    }

    fn on_configuration_data(&mut self, id: DeviceId, payload: &[u8], ctx: &mut SessionContext<'_>) {
        let Some(&sid) = self.by_device.get(&id) else {
            warn!("Configuration data from {} without a session", id);
            return;
        };
        if self.state_of(sid) == Some(SessionState::Invalidated) {
            info!("Ignoring configuration data from {}: session {} invalidated", id, sid);
            return;
        }

        let result = self
            .capability
            .parse_configuration(payload)
            .and_then(|configuration| self.capability.run(sid, &configuration));
        match result {
            Ok(()) => debug!("Session {} running for {}", sid, id),
            Err(error) => self.on_invalidated(sid, id, error, ctx),
        }
    }

    fn on_ranging_started(&mut self, id: DeviceId, ctx: &mut SessionContext<'_>) {
        let Some(&sid) = self.by_device.get(&id) else {
            warn!("Accessory {} started ranging without a session", id);
            return;
        };
        if self.state_of(sid) == Some(SessionState::Invalidated) {
            info!("Ignoring ranging start from {}: session {} invalidated", id, sid);
            return;
        }
        if ctx.registry.set_status(id, DeviceStatus::Ranging).is_err() {
            return;
        }
        let _ = ctx.registry.touch(id, ctx.now_ms);
        info!("Accessory {} started ranging", id);
        self.send_event(AppEvent::RangingStarted(id));
        self.transition(sid, SessionState::Running);
    }

    /// A stop while running comes from the accessory itself. A stop in any
    /// other state answers one of our own `Stop` messages.
    fn on_ranging_stopped(&mut self, id: DeviceId, ctx: &mut SessionContext<'_>) -> bool {
        let Some(&sid) = self.by_device.get(&id) else {
            debug!("Accessory {} stopped ranging without a session", id);
            return false;
        };
        self.settle_device(id, ctx);
        if self.state_of(sid) != Some(SessionState::Running) {
            debug!("Accessory {} acknowledged stop", id);
            return false;
        }

        info!("Accessory {} ended session {}", id, sid);
        self.discard(id);
        true
    }

    fn on_update(
        &mut self,
        sid: SessionId,
        id: DeviceId,
        update: NearbyUpdate,
        ctx: &mut SessionContext<'_>,
    ) -> bool {
        let Some(distance) = update.distance.filter(|d| d.is_finite()) else {
            return false;
        };
        let converged = self.sessions.get(&sid).is_some_and(|s| s.converged);
        let direction = match (update.direction, update.horizontal_angle) {
            (Some(direction), _) => Some(direction),
            (None, Some(angle)) if converged => Some(direction_from_horizontal_angle(angle)),
            _ => None,
        };
        if ctx
            .registry
            .set_location(id, distance, direction, update.vertical, ctx.now_ms)
            .is_err()
        {
            return false;
        }

        self.send_event(AppEvent::LocationUpdated {
            id,
            distance: distance.max(0.0),
            direction,
            azimuth_deg: direction.map(|d| azimuth(d, self.direction_enabled).to_degrees()),
            elevation_deg: direction.map(|d| elevation(d).to_degrees()),
            elevation: update.vertical,
        });
        true
    }

    fn on_removed(
        &mut self,
        sid: SessionId,
        id: DeviceId,
        reason: RemovalReason,
        ctx: &mut SessionContext<'_>,
    ) {
        let retry_count = self.sessions.get(&sid).map_or(0, |s| s.retry_count);
        let retry = reason == RemovalReason::Timeout
            && self
                .retry_policy
                .should_retry(ctx.registry.status(id), retry_count);

        self.settle_device(id, ctx);
        if retry {
            info!("Session {} of {} timed out, restarting", sid, id);
            self.send(id, &HostMessage::Stop, ctx);
            self.send(id, &HostMessage::Initialize, ctx);
            if let Some(session) = self.sessions.get_mut(&sid) {
                session.retry_count += 1;
            }
            self.transition(sid, SessionState::Initializing);
        } else {
            info!("Session {} of {} removed ({:?})", sid, id, reason);
            self.capability.invalidate(sid);
            self.transition(sid, SessionState::Invalidated);
        }
    }

    fn on_invalidated(
        &mut self,
        sid: SessionId,
        id: DeviceId,
        error: RangingError,
        ctx: &mut SessionContext<'_>,
    ) {
        self.settle_device(id, ctx);

        if error.is_terminal() {
            warn!("Session {} of {} failed: {}", sid, id, error);
            self.capability.invalidate(sid);
            self.transition(sid, SessionState::Invalidated);
            self.send_event(AppEvent::ConfigurationError {
                id,
                reason: error.to_string(),
            });
            return;
        }

        let retry_count = self.sessions.get(&sid).map_or(0, |s| s.retry_count);
        if self
            .retry_policy
            .should_retry(ctx.registry.status(id), retry_count)
        {
            info!("Session {} of {} invalidated ({}), retrying", sid, id, error);
            self.send(id, &HostMessage::Stop, ctx);
            self.discard(id);
            self.open(id, retry_count + 1, ctx);
        } else {
            warn!("Session {} of {} invalidated ({}), giving up", sid, id, error);
            self.capability.invalidate(sid);
            self.transition(sid, SessionState::Invalidated);
            self.send_log(
                &format!("Ranging with {} stopped: {}", id, error),
                MessageSeverity::Warning,
            );
        }
    }

    fn open(&mut self, id: DeviceId, retry_count: u32, ctx: &mut SessionContext<'_>) {
        let sid = SessionId(self.next_session);
        self.next_session += 1;

        self.capability.create_session(sid);
        self.sessions.insert(
            sid,
            RangingSession {
                id: sid,
                device: id,
                state: SessionState::Initializing,
                retry_count,
                converged: false,
            },
        );
        self.by_device.insert(id, sid);
        self.send_event(AppEvent::SessionStateChanged {
            id,
            session: sid,
            state: SessionState::Initializing,
        });
        self.send(id, &HostMessage::Initialize, ctx);
    }

    /// Remove the device's session from both maps and release it.
    fn discard(&mut self, id: DeviceId) -> Option<RangingSession> {
        let sid = self.by_device.remove(&id)?;
        let mut session = self.sessions.remove(&sid)?;
        if session.state != SessionState::Invalidated {
            self.capability.invalidate(sid);
            session.state = SessionState::Invalidated;
            self.send_event(AppEvent::SessionStateChanged {
                id,
                session: sid,
                state: SessionState::Invalidated,
            });
        }
        Some(session)
    }

    /// A device that was ranging goes back to Connected and its last
    /// reading is no longer trusted.
    fn settle_device(&mut self, id: DeviceId, ctx: &mut SessionContext<'_>) {
        if ctx.registry.status(id) == Some(DeviceStatus::Ranging) {
            let _ = ctx.registry.set_status(id, DeviceStatus::Connected);
            self.send_event(AppEvent::RangingStopped(id));
        }
        let _ = ctx.registry.mark_stale(id);
    }

    fn state_of(&self, sid: SessionId) -> Option<SessionState> {
        self.sessions.get(&sid).map(|s| s.state)
    }

    fn transition(&mut self, sid: SessionId, state: SessionState) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        session.state = state;
        let id = session.device;
        self.send_event(AppEvent::SessionStateChanged {
            id,
            session: sid,
            state,
        });
    }

    fn send(&self, id: DeviceId, message: &HostMessage, ctx: &mut SessionContext<'_>) {
        if let Err(e) = ctx.sink.send_message(id, message) {
            warn!("Failed to send {:?} to {}: {}", message.id(), id, e);
            self.send_event(AppEvent::TransportError {
                id: Some(id),
                reason: e.to_string(),
            });
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Device, ElevationEstimate};
    use crate::domain::retry::{DeviceStillKnown, MaxAttempts};
    use crate::infrastructure::ranging::AccessoryConfiguration;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<(DeviceId, HostMessage)>,
        fail: bool,
    }

    impl MessageSink for RecordingSink {
        fn send_message(&mut self, id: DeviceId, message: &HostMessage) -> Result<(), DriverError> {
            if self.fail {
                return Err(DriverError::NotConnected(id));
            }
            self.sent.push((id, message.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCapability {
        created: Vec<SessionId>,
        ran: Vec<SessionId>,
        invalidated: Vec<SessionId>,
        reject_with: Option<RangingError>,
    }

    impl RangingCapability for FakeCapability {
        fn parse_configuration(&self, payload: &[u8]) -> Result<AccessoryConfiguration, RangingError> {
            match &self.reject_with {
                Some(error) => Err(error.clone()),
                None => Ok(AccessoryConfiguration(payload.to_vec())),
            }
        }

        fn create_session(&mut self, session: SessionId) {
            self.created.push(session);
        }

        fn run(&mut self, session: SessionId, _: &AccessoryConfiguration) -> Result<(), RangingError> {
            self.ran.push(session);
            Ok(())
        }

        fn invalidate(&mut self, session: SessionId) {
            self.invalidated.push(session);
        }
    }

    struct Harness {
        manager: SessionManager<FakeCapability>,
        registry: DeviceRegistry,
        sink: RecordingSink,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    const DEV: DeviceId = DeviceId(42);

    impl Harness {
        fn new(policy: Box<dyn RetryPolicy>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut registry = DeviceRegistry::new();
            let mut device = Device::new(DEV, "anchor", 0);
            device.status = DeviceStatus::Connected;
            registry.upsert(device);
            Self {
                manager: SessionManager::new(FakeCapability::default(), policy, true, tx),
                registry,
                sink: RecordingSink::default(),
                events: rx,
            }
        }

        fn with<T>(&mut self, f: impl FnOnce(&mut SessionManager<FakeCapability>, &mut SessionContext<'_>) -> T) -> T {
            let mut ctx = SessionContext {
                registry: &mut self.registry,
                sink: &mut self.sink,
                now_ms: 1000,
            };
            f(&mut self.manager, &mut ctx)
        }

        fn ranging_event(&mut self, kind: RangingEventKind) -> bool {
            let session = self.manager.session_for(DEV).map(|s| s.id).unwrap();
            self.with(|m, ctx| m.handle_ranging_event(RangingEvent { session, kind }, ctx))
        }

        fn drain(&mut self) -> Vec<AppEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn sent(&mut self) -> Vec<HostMessage> {
            self.sink.sent.drain(..).map(|(_, m)| m).collect()
        }

        /// Walk the handshake up to Running.
        fn run_to_ranging(&mut self) {
            self.with(|m, ctx| m.start(DEV, ctx));
            self.with(|m, ctx| {
                m.handle_message(DEV, AccessoryMessage::ConfigurationData(vec![1, 2]), ctx)
            });
            self.ranging_event(RangingEventKind::ShareableConfiguration(vec![9]));
            self.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::RangingStarted, ctx));
        }
    }

    #[test]
    fn test_handshake_reaches_running() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();

        assert_eq!(
            h.sent(),
            vec![HostMessage::Initialize, HostMessage::ConfigureAndStart(vec![9])]
        );
        assert_eq!(h.registry.status(DEV), Some(DeviceStatus::Ranging));
        let session = h.manager.session_for(DEV).unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(h.manager.capability().ran, vec![session.id]);
        assert!(h.drain().contains(&AppEvent::RangingStarted(DEV)));
    }

    #[test]
    fn test_timeout_with_retry_sends_stop_then_initialize() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();
        let sid = h.manager.session_for(DEV).unwrap().id;

        h.ranging_event(RangingEventKind::Removed(RemovalReason::Timeout));

        assert_eq!(h.sent(), vec![HostMessage::Stop, HostMessage::Initialize]);
        let session = h.manager.session_for(DEV).unwrap();
        assert_eq!(session.id, sid);
        assert_eq!(session.state, SessionState::Initializing);
        assert_eq!(session.retry_count, 1);
        assert_eq!(h.registry.status(DEV), Some(DeviceStatus::Connected));
    }

    #[test]
    fn test_timeout_without_retry_invalidates() {
        let mut h = Harness::new(Box::new(MaxAttempts { max: 0 }));
        h.run_to_ranging();
        h.sent();

        h.ranging_event(RangingEventKind::Removed(RemovalReason::Timeout));

        assert!(h.sent().is_empty());
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Invalidated);
    }

    #[test]
    fn test_terminal_invalidation_does_not_retry() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();
        h.drain();

        h.ranging_event(RangingEventKind::Invalidated(RangingError::PermissionDenied));

        assert!(h.sent().is_empty());
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Invalidated);
        let events = h.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::ConfigurationError { id, .. } if *id == DEV)));

        // Later configuration data is ignored until an explicit restart
        h.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::ConfigurationData(vec![1]), ctx));
        assert!(h.sent().is_empty());

        h.with(|m, ctx| m.restart_ranging(DEV, ctx)).unwrap();
        assert_eq!(h.sent(), vec![HostMessage::Initialize]);
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Initializing);
    }

    #[test]
    fn test_recoverable_invalidation_replaces_session() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();
        let old = h.manager.session_for(DEV).unwrap().id;

        h.ranging_event(RangingEventKind::Invalidated(RangingError::Other("reset".into())));

        assert_eq!(h.sent(), vec![HostMessage::Stop, HostMessage::Initialize]);
        let session = h.manager.session_for(DEV).unwrap().clone();
        assert_ne!(session.id, old);
        assert_eq!(session.retry_count, 1);
        assert_eq!(session.state, SessionState::Initializing);
        assert!(h.manager.capability().invalidated.contains(&old));
        assert_eq!(h.manager.len(), 1);

        // Callbacks for the discarded session are ignored
        let written = h.with(|m, ctx| {
            m.handle_ranging_event(
                RangingEvent {
                    session: old,
                    kind: RangingEventKind::Suspended,
                },
                ctx,
            )
        });
        assert!(!written);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_bad_configuration_is_terminal() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.manager.capability.reject_with = Some(RangingError::InvalidConfiguration("short".into()));
        h.with(|m, ctx| m.start(DEV, ctx));
        h.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::ConfigurationData(vec![0]), ctx));

        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Invalidated);
        assert_eq!(h.sent(), vec![HostMessage::Initialize]);
    }

    #[test]
    fn test_suspension_round_trip() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.ranging_event(RangingEventKind::Update(NearbyUpdate {
            distance: Some(1.0),
            direction: None,
            horizontal_angle: None,
            vertical: ElevationEstimate::Same,
        }));
        h.sent();

        h.ranging_event(RangingEventKind::Suspended);
        assert_eq!(h.sent(), vec![HostMessage::Stop]);
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Suspended);
        assert!(h.registry.get(DEV).unwrap().location.as_ref().unwrap().stale);

        h.ranging_event(RangingEventKind::SuspensionEnded);
        assert_eq!(h.sent(), vec![HostMessage::Initialize]);
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Initializing);
    }

    #[test]
    fn test_direction_selection() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.drain();

        let update = |angle| {
            RangingEventKind::Update(NearbyUpdate {
                distance: Some(2.0),
                direction: None,
                horizontal_angle: Some(angle),
                vertical: ElevationEstimate::Above,
            })
        };

        // Not converged: horizontal angle alone is not trusted
        assert!(h.ranging_event(update(0.5)));
        assert_eq!(h.registry.get(DEV).unwrap().location.as_ref().unwrap().direction, None);

        h.ranging_event(RangingEventKind::ConvergenceChanged(true));
        assert!(h.ranging_event(update(0.5)));
        let direction = h.registry.get(DEV).unwrap().location.clone().unwrap().direction.unwrap();
        assert!((direction[0] - 0.5f32.sin()).abs() < 1e-6);
        assert_eq!(direction[1], 0.0);

        let last = h.drain().pop().unwrap();
        match last {
            AppEvent::LocationUpdated {
                azimuth_deg,
                elevation_deg,
                elevation,
                ..
            } => {
                assert!((azimuth_deg.unwrap() - 0.5f32.to_degrees()).abs() < 1e-3);
                assert!((elevation_deg.unwrap() - 180.0).abs() < 1e-3);
                assert_eq!(elevation, ElevationEstimate::Above);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_cancel_drops_session_silently() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();

        assert!(h.manager.cancel(DEV));
        assert!(h.manager.session_for(DEV).is_none());
        assert!(h.manager.is_empty());
        assert!(h.sent().is_empty());
        assert!(!h.manager.cancel(DEV));
    }

    #[test]
    fn test_cancel_of_running_session_reports_ranging_stopped() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.drain();

        h.manager.cancel(DEV);
        assert!(h.drain().contains(&AppEvent::RangingStopped(DEV)));

        // Nothing was ranging yet
        h.with(|m, ctx| m.start(DEV, ctx));
        h.drain();
        h.manager.cancel(DEV);
        assert!(!h.drain().contains(&AppEvent::RangingStopped(DEV)));
    }

    #[test]
    fn test_accessory_stop_ends_running_session() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();
        h.drain();
        let sid = h.manager.session_for(DEV).unwrap().id;

        let ended = h.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::RangingStopped, ctx));

        assert!(ended);
        assert!(h.manager.session_for(DEV).is_none());
        assert!(h.manager.capability().invalidated.contains(&sid));
        assert_eq!(h.registry.status(DEV), Some(DeviceStatus::Connected));
        let events = h.drain();
        assert!(events.contains(&AppEvent::RangingStopped(DEV)));
        assert!(events.contains(&AppEvent::SessionStateChanged {
            id: DEV,
            session: sid,
            state: SessionState::Invalidated,
        }));

        // A stopped device is no longer pinged
        h.with(|m, ctx| m.send_liveness_pings(ctx));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_stop_acknowledgement_keeps_session() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.ranging_event(RangingEventKind::Suspended);
        h.sent();

        let ended = h.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::RangingStopped, ctx));

        assert!(!ended);
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Suspended);
    }

    #[test]
    fn test_invalidated_session_ignores_late_callbacks() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.ranging_event(RangingEventKind::Invalidated(RangingError::InvalidConfiguration(
            "bad".into(),
        )));
        h.sent();
        h.drain();

        for kind in [
            RangingEventKind::Removed(RemovalReason::Timeout),
            RangingEventKind::Suspended,
            RangingEventKind::SuspensionEnded,
            RangingEventKind::ShareableConfiguration(vec![9]),
            RangingEventKind::Update(NearbyUpdate {
                distance: Some(1.0),
                direction: None,
                horizontal_angle: None,
                vertical: ElevationEstimate::Same,
            }),
        ] {
            assert!(!h.ranging_event(kind));
        }
        h.with(|m, ctx| m.handle_message(DEV, AccessoryMessage::RangingStarted, ctx));

        assert!(h.sent().is_empty());
        assert!(h.drain().is_empty());
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Invalidated);
        assert_eq!(h.registry.status(DEV), Some(DeviceStatus::Connected));
    }

    #[test]
    fn test_suspension_end_ignored_while_running() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.run_to_ranging();
        h.sent();

        h.ranging_event(RangingEventKind::SuspensionEnded);

        assert!(h.sent().is_empty());
        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Running);
    }

    #[test]
    fn test_send_failure_does_not_roll_back() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.sink.fail = true;
        h.with(|m, ctx| m.start(DEV, ctx));

        assert_eq!(h.manager.session_for(DEV).unwrap().state, SessionState::Initializing);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, AppEvent::TransportError { id: Some(DEV), .. })));
    }

    #[test]
    fn test_restart_requires_connection() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.registry.set_status(DEV, DeviceStatus::Discovered).unwrap();
        assert_eq!(
            h.with(|m, ctx| m.restart_ranging(DEV, ctx)),
            Err(DriverError::NotConnected(DEV))
        );
        assert_eq!(
            h.with(|m, ctx| m.restart_ranging(DeviceId(7), ctx)),
            Err(DriverError::NoSuchDevice(DeviceId(7)))
        );
    }

    #[test]
    fn test_expire_locations() {
        let mut h = Harness::new(Box::new(DeviceStillKnown));
        h.registry
            .set_location(DEV, 1.0, None, ElevationEstimate::Unknown, 100)
            .unwrap();
        h.manager.expire_locations(&mut h.registry, 3000, 3000);
        assert!(!h.registry.get(DEV).unwrap().location.as_ref().unwrap().stale);
        h.manager.expire_locations(&mut h.registry, 3101, 3000);
        assert!(h.registry.get(DEV).unwrap().location.as_ref().unwrap().stale);
    }
}
