//! BLE connection management.
//!
//! [`ConnectionStateMachine`] owns the single GATT session: it issues the
//! connect request, reacts to transport events, runs service discovery,
//! hands off to the [`NotificationEnabler`] and routes notification
//! payloads through the decoder. It is driven by exactly one owner (see
//! [`crate::sensor::SensorConnection`]), so its state needs no locking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::authorization::Authorization;
use crate::ble::notifications::{EnableFailure, EnableProgress, NotificationEnabler};
use crate::ble::transport::{
    ConnectionStatus, DiscoveredService, GattTransport, LinkState, TransportEvent, GATT_FAILURE,
    GATT_SUCCESS,
};
use crate::ble::uuids::is_environment_service;
use crate::data::{Device, MeasurementChannel};
use crate::error::{Error, FailureKind, Result};
use crate::protocol::decode_reading;
use crate::publisher::ReadingPublisher;

/// Connection state for the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session exists.
    #[default]
    Disconnected,
    /// Waiting for the link to come up.
    Connecting,
    /// Link is up; discovering services.
    ServiceDiscovery,
    /// Running the notification handshake.
    EnablingNotifications,
    /// Setup complete; readings are streaming.
    Ready,
    /// The session failed and is being released.
    Error(FailureKind),
}

impl ConnectionState {
    /// Check if the session is ready.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if setup is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::EnablingNotifications
        )
    }

    /// Check if a new connection may be started.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::EnablingNotifications => write!(f, "EnablingNotifications"),
            Self::Ready => write!(f, "Ready"),
            Self::Error(kind) => write!(f, "Error({})", kind),
        }
    }
}

/// Connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long to wait for each CCCD write acknowledgment.
    pub descriptor_write_timeout: Duration,
    /// Whether to request a high-priority connection interval.
    pub request_high_priority: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            descriptor_write_timeout: Duration::from_secs(2),
            request_high_priority: true,
        }
    }
}

/// Resources held for the current session.
struct Session {
    device: Device,
    enabler: NotificationEnabler,
}

/// Owns the connection lifecycle for one sensor at a time.
pub struct ConnectionStateMachine<T: GattTransport> {
    transport: T,
    state: ConnectionState,
    session: Option<Session>,
    publisher: Arc<ReadingPublisher>,
    authorization: Arc<dyn Authorization>,
    config: ConnectionConfig,
}

impl<T: GattTransport> ConnectionStateMachine<T> {
    /// Create a state machine in the `Disconnected` state.
    pub fn new(
        transport: T,
        publisher: Arc<ReadingPublisher>,
        authorization: Arc<dyn Authorization>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            session: None,
            publisher,
            authorization,
            config,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Device of the current session.
    pub fn device(&self) -> Option<&Device> {
        self.session.as_ref().map(|s| &s.device)
    }

    /// Start connecting to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if the capability is not granted,
    /// [`Error::InvalidState`] if a session already exists, or the
    /// transport's error if the request could not be issued.
    pub fn connect(&mut self, device: Device) -> Result<()> {
        self.authorize()?;

        if !self.state.is_idle() {
            warn!("Rejecting connect to {} while {}", device, self.state);
            return Err(Error::InvalidState { state: self.state });
        }

        info!("Connecting to {}", device);

        if let Err(e) = self.transport.connect(&device) {
            error!("Failed to start connection to {}: {}", device, e);
            self.transport.close();
            self.publisher.report_with(
                FailureKind::ConnectionFailed(ConnectionStatus::Unknown(GATT_FAILURE)),
                format!("Failed to connect to {}: {}", device, e),
            );
            return Err(e);
        }

        self.session = Some(Session {
            device,
            enabler: NotificationEnabler::new(
                self.config.descriptor_write_timeout,
                self.authorization.clone(),
            ),
        });
        self.publisher.reset_channel_status();
        self.set_state(ConnectionState::Connecting);

        Ok(())
    }

    /// Tear down the session, if any.
    pub fn disconnect(&mut self) {
        self.close_connection();
    }

    /// Release every session resource and return to `Disconnected`.
    ///
    /// Idempotent: with no session this only ensures the state.
    pub fn close_connection(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Closing connection to {}", session.device);
            if let Err(e) = self.transport.disconnect() {
                debug!("Disconnect request failed: {}", e);
            }
            self.transport.close();
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Request an explicit read of a channel.
    ///
    /// The value arrives later and is published like a notification.
    pub fn read_channel(&mut self, channel: MeasurementChannel) -> Result<()> {
        self.authorize()?;

        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }

        debug!("Reading {}", channel);
        self.transport
            .read_characteristic(channel.characteristic_uuid())
    }

    /// Feed one transport event into the state machine.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionStateChanged { status, link } => {
                self.on_connection_state_changed(status, link)
            }
            TransportEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services, now)
            }
            TransportEvent::DescriptorWritten {
                characteristic,
                status,
            } => self.on_descriptor_written(characteristic, status, now),
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.decode_and_publish(characteristic, &value),
            TransportEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } => {
                if status == GATT_SUCCESS {
                    self.decode_and_publish(characteristic, &value);
                } else {
                    warn!("Read of {} failed with status {}", characteristic, status);
                }
            }
        }
    }

    /// Deadline of the outstanding descriptor write, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::EnablingNotifications {
            return None;
        }
        self.session.as_ref().and_then(|s| s.enabler.next_deadline())
    }

    /// Handle expiry of the descriptor write deadline.
    pub fn on_deadline(&mut self, now: Instant) {
        if self.state != ConnectionState::EnablingNotifications {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let progress = session.enabler.on_deadline(&mut self.transport, now);
        self.apply_progress(progress);
    }

    fn on_connection_state_changed(&mut self, code: i32, link: LinkState) {
        let status = ConnectionStatus::from_code(code);
        debug!(
            "Connection state change: status={}, link={:?}, state={}",
            status, link, self.state
        );

        if self.session.is_none() {
            debug!("No session, ignoring link event");
            return;
        }

        match link {
            LinkState::Connected if status.is_success() => {
                if self.state != ConnectionState::Connecting {
                    debug!("Ignoring connected event while {}", self.state);
                    return;
                }

                info!("Connected, discovering services");

                if self.config.request_high_priority {
                    if let Err(e) = self.transport.request_high_priority() {
                        debug!("High priority request ignored: {}", e);
                    }
                }

                if let Err(e) = self.transport.discover_services() {
                    error!("Failed to start service discovery: {}", e);
                    self.fail(FailureKind::ServiceDiscoveryFailed(GATT_FAILURE));
                    return;
                }

                self.set_state(ConnectionState::ServiceDiscovery);
            }
            LinkState::Disconnected if status.is_success() => {
                info!("Disconnected from sensor");
                self.close_connection();
            }
            LinkState::Connected | LinkState::Disconnected => {
                error!("Connection failed: {}", status);
                self.fail(FailureKind::ConnectionFailed(status));
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                debug!("Ignoring intermediate link state {:?}", link);
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        status: i32,
        services: &[DiscoveredService],
        now: Instant,
    ) {
        if self.state != ConnectionState::ServiceDiscovery {
            debug!("Ignoring service discovery result while {}", self.state);
            return;
        }

        if status != GATT_SUCCESS {
            error!("Service discovery failed with status {}", status);
            self.fail(FailureKind::ServiceDiscoveryFailed(status));
            return;
        }

        let Some(service) = services.iter().find(|s| is_environment_service(&s.uuid)) else {
            error!("Environmental service not found, available services:");
            for service in services {
                debug!("  Service: {}", service.uuid);
                for characteristic in &service.characteristics {
                    debug!("    Characteristic: {}", characteristic);
                }
            }
            self.fail(FailureKind::ServiceNotFound);
            return;
        };

        debug!(
            "Found environmental service with {} characteristics",
            service.characteristics.len()
        );
        self.set_state(ConnectionState::EnablingNotifications);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let progress = session
            .enabler
            .start(&mut self.transport, &service.characteristics, now);
        self.apply_progress(progress);
    }

    fn on_descriptor_written(&mut self, characteristic: Uuid, status: i32, now: Instant) {
        if self.state != ConnectionState::EnablingNotifications {
            debug!(
                "Ignoring descriptor ack for {} while {}",
                characteristic, self.state
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let progress = session
            .enabler
            .on_descriptor_written(&mut self.transport, characteristic, status, now);
        self.apply_progress(progress);
    }

    fn apply_progress(&mut self, progress: EnableProgress) {
        if let Some(session) = &self.session {
            for channel in MeasurementChannel::ALL {
                self.publisher
                    .set_channel_status(channel, session.enabler.status(channel));
            }
        }

        match progress {
            EnableProgress::InFlight(channel) => {
                debug!("Waiting for {} acknowledgment", channel);
            }
            EnableProgress::Ignored => {}
            EnableProgress::Finished(summary) => {
                if let Some((channel, failure)) = summary.failure() {
                    let kind = match failure {
                        EnableFailure::PermissionDenied => FailureKind::PermissionDenied,
                        _ => FailureKind::DescriptorWriteFailed(channel),
                    };
                    self.publisher.report(kind);
                }

                let enabled = summary.enabled();
                info!(
                    "Notification setup finished, {} of {} channels live",
                    enabled.len(),
                    MeasurementChannel::COUNT
                );
                self.set_state(ConnectionState::Ready);
                self.publisher.info(format!(
                    "Connected, {} of {} channels streaming",
                    enabled.len(),
                    MeasurementChannel::COUNT
                ));
            }
        }
    }

    /// Decode a payload and publish it. Shared by notifications and reads.
    fn decode_and_publish(&mut self, characteristic: Uuid, value: &[u8]) {
        if self.session.is_none() {
            debug!("No session, dropping payload from {}", characteristic);
            return;
        }

        let Some(channel) = MeasurementChannel::from_uuid(&characteristic) else {
            debug!("Ignoring payload from unknown characteristic {}", characteristic);
            return;
        };

        debug!("{} payload: {:02X?}", channel, value);

        match decode_reading(channel, value, Utc::now()) {
            Ok(reading) => self.publisher.publish_reading(reading),
            Err(e) => {
                debug!(
                    "Keeping previous {} value, payload {:?}: {}",
                    channel,
                    String::from_utf8_lossy(value),
                    e
                );
                self.publisher.report(FailureKind::MalformedPayload(channel));
            }
        }
    }

    fn authorize(&self) -> Result<()> {
        if self.authorization.is_granted() {
            self.publisher.set_authorized(true);
            Ok(())
        } else {
            self.publisher.report(FailureKind::PermissionDenied);
            Err(Error::PermissionDenied)
        }
    }

    fn fail(&mut self, kind: FailureKind) {
        self.set_state(ConnectionState::Error(kind));
        self.publisher.report(kind);
        self.close_connection();
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            debug!("Connection state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
            self.publisher.set_state(new_state);
        }
    }
}

impl<T: GattTransport> std::fmt::Debug for ConnectionStateMachine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("device", &self.device())
            .finish()
    }
}
