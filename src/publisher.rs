//! Latest-value publication.
//!
//! [`ReadingPublisher`] holds the most recent reading of every channel and
//! the current connection state, and broadcasts changes to subscribers.
//! Subscribers only observe changes made after they subscribed; current
//! values are available through the accessor methods.

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::ble::connection::ConnectionState;
use crate::ble::notifications::ChannelStatus;
use crate::data::{MeasurementChannel, Reading, SensorSnapshot};
use crate::error::{Error, FailureKind};

/// Human-readable status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Informational progress message.
    Info(String),
    /// A failure the user should see.
    Failure {
        /// Classification of the failure.
        kind: FailureKind,
        /// Display message.
        message: String,
    },
}

impl StatusEvent {
    /// Build a failure event with the stable message for `kind`.
    pub fn failure(kind: FailureKind) -> Self {
        Self::Failure {
            kind,
            message: Error::from(kind).to_string(),
        }
    }

    /// The failure kind, if this is a failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Info(_) => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info(message) => write!(f, "{}", message),
            Self::Failure { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Publishes readings, connection state and status updates.
pub struct ReadingPublisher {
    /// Latest reading per channel, indexed by [`MeasurementChannel::index`].
    latest: RwLock<[Option<Reading>; MeasurementChannel::COUNT]>,
    /// Notification status per channel.
    channels: RwLock<[ChannelStatus; MeasurementChannel::COUNT]>,
    /// Connection state.
    state_tx: watch::Sender<ConnectionState>,
    /// Every connection state transition, including transient error states.
    transition_tx: broadcast::Sender<ConnectionState>,
    /// Combined latest values.
    snapshot_tx: watch::Sender<SensorSnapshot>,
    /// Individual readings as they are decoded.
    reading_tx: broadcast::Sender<Reading>,
    /// Status and error messages.
    status_tx: broadcast::Sender<StatusEvent>,
    /// Whether the last authorization check passed.
    authorized_tx: watch::Sender<bool>,
}

impl ReadingPublisher {
    /// Create a publisher with no readings and a disconnected state.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transition_tx, _) = broadcast::channel(32);
        let (snapshot_tx, _) = watch::channel(SensorSnapshot::default());
        let (reading_tx, _) = broadcast::channel(64);
        let (status_tx, _) = broadcast::channel(32);
        let (authorized_tx, _) = watch::channel(true);

        Self {
            latest: RwLock::new([None; MeasurementChannel::COUNT]),
            channels: RwLock::new([ChannelStatus::NotAttempted; MeasurementChannel::COUNT]),
            state_tx,
            transition_tx,
            snapshot_tx,
            reading_tx,
            status_tx,
            authorized_tx,
        }
    }

    // === Readings ===

    /// Replace the latest reading for the reading's channel.
    pub fn publish_reading(&self, reading: Reading) {
        let snapshot = {
            let mut latest = self.latest.write();
            latest[reading.channel.index()] = Some(reading);
            SensorSnapshot::from_latest(&latest)
        };

        debug!("Published {}", reading);
        self.snapshot_tx.send_replace(snapshot);
        let _ = self.reading_tx.send(reading);
    }

    /// Latest reading for a channel.
    pub fn latest(&self, channel: MeasurementChannel) -> Option<Reading> {
        self.latest.read()[channel.index()]
    }

    /// Latest value of every channel.
    pub fn snapshot(&self) -> SensorSnapshot {
        *self.snapshot_tx.borrow()
    }

    /// Subscribe to individual readings.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.reading_tx.subscribe()
    }

    /// Subscribe to combined snapshots.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    // === Connection state ===

    /// Set the connection state. Returns `true` if it changed.
    pub fn set_state(&self, state: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.transition_tx.send(state);
        }
        changed
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to the current connection state.
    ///
    /// Intermediate states may be skipped if the receiver falls behind; use
    /// [`subscribe_transitions`](Self::subscribe_transitions) to see every step.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to every connection state transition.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transition_tx.subscribe()
    }

    // === Channel status ===

    /// Record the notification status of a channel.
    pub fn set_channel_status(&self, channel: MeasurementChannel, status: ChannelStatus) {
        self.channels.write()[channel.index()] = status;
    }

    /// Notification status of a channel.
    pub fn channel_status(&self, channel: MeasurementChannel) -> ChannelStatus {
        self.channels.read()[channel.index()]
    }

    /// Reset every channel to [`ChannelStatus::NotAttempted`].
    pub fn reset_channel_status(&self) {
        *self.channels.write() = [ChannelStatus::NotAttempted; MeasurementChannel::COUNT];
    }

    // === Status ===

    /// Publish a failure on the status stream.
    pub fn report(&self, kind: FailureKind) {
        self.send_failure(StatusEvent::failure(kind));
    }

    /// Publish a failure with a specific message.
    pub fn report_with(&self, kind: FailureKind, message: impl Into<String>) {
        self.send_failure(StatusEvent::Failure {
            kind,
            message: message.into(),
        });
    }

    fn send_failure(&self, event: StatusEvent) {
        if event.kind() == Some(FailureKind::PermissionDenied) {
            self.set_authorized(false);
        }
        warn!("{}", event);
        let _ = self.status_tx.send(event);
    }

    /// Publish an informational message.
    pub fn info(&self, message: impl Into<String>) {
        let _ = self.status_tx.send(StatusEvent::Info(message.into()));
    }

    /// Subscribe to status updates.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    // === Authorization ===

    /// Record the outcome of the latest authorization check.
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized_tx.send_if_modified(|current| {
            let changed = *current != authorized;
            *current = authorized;
            changed
        });
    }

    /// Whether the latest authorization check passed.
    pub fn is_authorized(&self) -> bool {
        *self.authorized_tx.borrow()
    }

    /// Subscribe to authorization flag changes.
    pub fn subscribe_authorized(&self) -> watch::Receiver<bool> {
        self.authorized_tx.subscribe()
    }
}

impl Default for ReadingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingPublisher")
            .field("state", &self.state())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
