//! Sequenced notification setup.
//!
//! The peer serializes configuration writes on a connection and rejects
//! overlapping requests, so notifications are enabled one channel at a time
//! in [`MeasurementChannel::ALL`] order. For each channel the local delivery
//! is enabled first, then the CCCD is written; the next channel starts only
//! after the peer acknowledges that write. The first failure halts the
//! chain. Failures stay local to their channel and never fail the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authorization::Authorization;
use crate::ble::transport::{GattTransport, GATT_SUCCESS};
use crate::ble::uuids::{CCCD_UUID, ENABLE_NOTIFICATION_VALUE};
use crate::data::MeasurementChannel;

/// Why enabling notifications failed for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnableFailure {
    /// The transport capability was not granted.
    PermissionDenied,
    /// The characteristic is not offered by the peer's service.
    CharacteristicMissing,
    /// The transport refused to enable local delivery.
    LocalEnableRejected,
    /// The transport refused to start the descriptor write.
    WriteNotStarted,
    /// The peer acknowledged the write with an error status.
    WriteRejected(i32),
    /// No acknowledgment arrived before the deadline.
    TimedOut,
}

impl std::fmt::Display for EnableFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::CharacteristicMissing => write!(f, "characteristic missing"),
            Self::LocalEnableRejected => write!(f, "local enable rejected"),
            Self::WriteNotStarted => write!(f, "descriptor write not started"),
            Self::WriteRejected(status) => write!(f, "descriptor write rejected ({})", status),
            Self::TimedOut => write!(f, "descriptor write timed out"),
        }
    }
}

/// Notification status of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelStatus {
    /// Not attempted in this session.
    #[default]
    NotAttempted,
    /// CCCD write issued, waiting for the acknowledgment.
    Pending,
    /// Notifications are flowing.
    Enabled,
    /// Setup failed; the channel gets no live updates.
    Failed(EnableFailure),
}

impl ChannelStatus {
    /// Check if notifications are enabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Per-channel request slot. At most one write is outstanding per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    AwaitingAck { deadline: Instant },
    Enabled,
    Failed(EnableFailure),
}

impl Slot {
    fn status(&self) -> ChannelStatus {
        match self {
            Slot::Idle => ChannelStatus::NotAttempted,
            Slot::AwaitingAck { .. } => ChannelStatus::Pending,
            Slot::Enabled => ChannelStatus::Enabled,
            Slot::Failed(failure) => ChannelStatus::Failed(*failure),
        }
    }
}

/// Final state of a notification chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableSummary {
    /// Status per channel, indexed by [`MeasurementChannel::index`].
    pub statuses: [ChannelStatus; MeasurementChannel::COUNT],
}

impl EnableSummary {
    /// Channels with live notifications.
    pub fn enabled(&self) -> Vec<MeasurementChannel> {
        MeasurementChannel::ALL
            .into_iter()
            .filter(|c| self.statuses[c.index()].is_enabled())
            .collect()
    }

    /// The channel that halted the chain, if any.
    pub fn failure(&self) -> Option<(MeasurementChannel, EnableFailure)> {
        MeasurementChannel::ALL
            .into_iter()
            .find_map(|c| match self.statuses[c.index()] {
                ChannelStatus::Failed(failure) => Some((c, failure)),
                _ => None,
            })
    }
}

/// Outcome of feeding a step into the enabler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableProgress {
    /// A CCCD write for this channel is awaiting acknowledgment.
    InFlight(MeasurementChannel),
    /// The chain is over, successfully or halted.
    Finished(EnableSummary),
    /// The input did not match an outstanding request.
    Ignored,
}

/// Drives the ordered enable handshake for one session.
pub struct NotificationEnabler {
    slots: [Slot; MeasurementChannel::COUNT],
    available: Vec<Uuid>,
    current: Option<MeasurementChannel>,
    write_timeout: Duration,
    authorization: Arc<dyn Authorization>,
}

impl NotificationEnabler {
    /// Create an idle enabler.
    pub fn new(write_timeout: Duration, authorization: Arc<dyn Authorization>) -> Self {
        Self {
            slots: [Slot::Idle; MeasurementChannel::COUNT],
            available: Vec::new(),
            current: None,
            write_timeout,
            authorization,
        }
    }

    /// Start the chain at the first channel.
    ///
    /// `available` lists the characteristics of the discovered service.
    pub fn start(
        &mut self,
        transport: &mut dyn GattTransport,
        available: &[Uuid],
        now: Instant,
    ) -> EnableProgress {
        self.slots = [Slot::Idle; MeasurementChannel::COUNT];
        self.available = available.to_vec();
        info!("Enabling notifications for {} channels", MeasurementChannel::COUNT);
        self.begin(transport, MeasurementChannel::Temperature, now)
    }

    /// Handle a descriptor write acknowledgment.
    pub fn on_descriptor_written(
        &mut self,
        transport: &mut dyn GattTransport,
        characteristic: Uuid,
        status: i32,
        now: Instant,
    ) -> EnableProgress {
        let Some(channel) = MeasurementChannel::from_uuid(&characteristic) else {
            debug!("Ignoring descriptor ack for foreign characteristic {}", characteristic);
            return EnableProgress::Ignored;
        };

        if !matches!(self.slots[channel.index()], Slot::AwaitingAck { .. }) {
            debug!("Ignoring unexpected descriptor ack for {}", channel);
            return EnableProgress::Ignored;
        }

        if status != GATT_SUCCESS {
            warn!(
                "Peer rejected notification enable for {} (status {})",
                channel, status
            );
            Self::revert(transport, channel);
            return self.halt(channel, EnableFailure::WriteRejected(status));
        }

        info!("Notifications enabled for {}", channel);
        self.slots[channel.index()] = Slot::Enabled;

        match channel.next() {
            Some(next) => self.begin(transport, next, now),
            None => self.finish(),
        }
    }

    /// Fail the outstanding write if its deadline has passed.
    pub fn on_deadline(&mut self, transport: &mut dyn GattTransport, now: Instant) -> EnableProgress {
        let Some(channel) = self.current else {
            return EnableProgress::Ignored;
        };

        match self.slots[channel.index()] {
            Slot::AwaitingAck { deadline } if deadline <= now => {
                warn!("Timed out waiting for {} descriptor ack", channel);
                Self::revert(transport, channel);
                self.halt(channel, EnableFailure::TimedOut)
            }
            _ => EnableProgress::Ignored,
        }
    }

    /// Deadline of the outstanding write, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().find_map(|slot| match slot {
            Slot::AwaitingAck { deadline } => Some(*deadline),
            _ => None,
        })
    }

    /// Current status of a channel.
    pub fn status(&self, channel: MeasurementChannel) -> ChannelStatus {
        self.slots[channel.index()].status()
    }

    /// Snapshot of every channel.
    pub fn summary(&self) -> EnableSummary {
        EnableSummary {
            statuses: [
                self.slots[0].status(),
                self.slots[1].status(),
                self.slots[2].status(),
            ],
        }
    }

    fn begin(
        &mut self,
        transport: &mut dyn GattTransport,
        channel: MeasurementChannel,
        now: Instant,
    ) -> EnableProgress {
        self.current = Some(channel);
        let uuid = channel.characteristic_uuid();

        if !self.authorization.is_granted() {
            warn!("Not authorized to enable notifications for {}", channel);
            return self.halt(channel, EnableFailure::PermissionDenied);
        }

        if !self.available.contains(&uuid) {
            warn!("Characteristic for {} not found: {}", channel, uuid);
            return self.halt(channel, EnableFailure::CharacteristicMissing);
        }

        if let Err(e) = transport.set_local_notifications(uuid, true) {
            warn!("Failed to enable local notifications for {}: {}", channel, e);
            return self.halt(channel, EnableFailure::LocalEnableRejected);
        }

        if let Err(e) = transport.write_descriptor(uuid, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE) {
            warn!("Failed to write CCCD for {}: {}", channel, e);
            Self::revert(transport, channel);
            return self.halt(channel, EnableFailure::WriteNotStarted);
        }

        debug!("CCCD write issued for {}", channel);
        self.slots[channel.index()] = Slot::AwaitingAck {
            deadline: now + self.write_timeout,
        };
        EnableProgress::InFlight(channel)
    }

    fn revert(transport: &mut dyn GattTransport, channel: MeasurementChannel) {
        if let Err(e) = transport.set_local_notifications(channel.characteristic_uuid(), false) {
            debug!("Failed to revert local notifications for {}: {}", channel, e);
        }
    }

    fn halt(&mut self, channel: MeasurementChannel, failure: EnableFailure) -> EnableProgress {
        self.slots[channel.index()] = Slot::Failed(failure);
        self.finish()
    }

    fn finish(&mut self) -> EnableProgress {
        self.current = None;
        EnableProgress::Finished(self.summary())
    }
}

impl std::fmt::Debug for NotificationEnabler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEnabler")
            .field("slots", &self.slots)
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AuthorizationFlag, Granted};
    use crate::ble::transport::testing::{Call, RecordingTransport};
    use crate::ble::uuids::*;
    use pretty_assertions::assert_eq;

    const TEMP: Uuid = TEMPERATURE_CHARACTERISTIC_UUID;
    const HUM: Uuid = HUMIDITY_CHARACTERISTIC_UUID;
    const PRES: Uuid = PRESSURE_CHARACTERISTIC_UUID;

    fn enabler() -> NotificationEnabler {
        NotificationEnabler::new(Duration::from_secs(2), Arc::new(Granted))
    }

    fn all() -> Vec<Uuid> {
        vec![TEMP, HUM, PRES]
    }

    #[test]
    fn test_chain_runs_in_order() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        let now = Instant::now();

        assert_eq!(
            enabler.start(&mut transport, &all(), now),
            EnableProgress::InFlight(MeasurementChannel::Temperature)
        );
        assert_eq!(transport.descriptor_writes(), vec![TEMP]);

        assert_eq!(
            enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now),
            EnableProgress::InFlight(MeasurementChannel::Humidity)
        );
        // Pressure must wait for the humidity acknowledgment.
        assert_eq!(transport.descriptor_writes(), vec![TEMP, HUM]);

        assert_eq!(
            enabler.on_descriptor_written(&mut transport, HUM, GATT_SUCCESS, now),
            EnableProgress::InFlight(MeasurementChannel::Pressure)
        );
        assert_eq!(transport.descriptor_writes(), vec![TEMP, HUM, PRES]);

        let EnableProgress::Finished(summary) =
            enabler.on_descriptor_written(&mut transport, PRES, GATT_SUCCESS, now)
        else {
            panic!("chain should finish");
        };
        assert_eq!(summary.enabled(), MeasurementChannel::ALL.to_vec());
        assert_eq!(summary.failure(), None);
        assert_eq!(enabler.next_deadline(), None);
    }

    #[test]
    fn test_local_enable_precedes_descriptor_write() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        enabler.start(&mut transport, &all(), Instant::now());

        assert_eq!(
            transport.calls(),
            vec![
                Call::SetLocalNotifications(TEMP, true),
                Call::WriteDescriptor(TEMP, CCCD_UUID, ENABLE_NOTIFICATION_VALUE.to_vec()),
            ]
        );
    }

    #[test]
    fn test_rejected_ack_halts_chain() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        let now = Instant::now();

        enabler.start(&mut transport, &all(), now);
        enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now);
        let progress = enabler.on_descriptor_written(&mut transport, HUM, 3, now);

        let EnableProgress::Finished(summary) = progress else {
            panic!("chain should halt");
        };
        assert_eq!(
            summary.failure(),
            Some((MeasurementChannel::Humidity, EnableFailure::WriteRejected(3)))
        );
        assert_eq!(summary.enabled(), vec![MeasurementChannel::Temperature]);
        assert_eq!(
            enabler.status(MeasurementChannel::Pressure),
            ChannelStatus::NotAttempted
        );
        assert!(!transport.descriptor_writes().contains(&PRES));
        assert!(transport
            .calls()
            .contains(&Call::SetLocalNotifications(HUM, false)));
    }

    #[test]
    fn test_local_enable_failure_aborts_remaining_channels() {
        let mut transport = RecordingTransport::new();
        transport.failures.lock().local_enable.insert(TEMP);
        let mut enabler = enabler();

        let EnableProgress::Finished(summary) =
            enabler.start(&mut transport, &all(), Instant::now())
        else {
            panic!("chain should abort");
        };
        assert_eq!(
            summary.failure(),
            Some((
                MeasurementChannel::Temperature,
                EnableFailure::LocalEnableRejected
            ))
        );
        assert!(transport.descriptor_writes().is_empty());
        assert_eq!(
            enabler.status(MeasurementChannel::Humidity),
            ChannelStatus::NotAttempted
        );
    }

    #[test]
    fn test_write_not_started_reverts_local_enable() {
        let mut transport = RecordingTransport::new();
        transport.failures.lock().write_descriptor.insert(TEMP);
        let mut enabler = enabler();

        let progress = enabler.start(&mut transport, &all(), Instant::now());
        assert!(matches!(progress, EnableProgress::Finished(_)));
        assert_eq!(
            transport.calls().last(),
            Some(&Call::SetLocalNotifications(TEMP, false))
        );
        assert_eq!(
            enabler.status(MeasurementChannel::Temperature),
            ChannelStatus::Failed(EnableFailure::WriteNotStarted)
        );
    }

    #[test]
    fn test_missing_characteristic_halts() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        let now = Instant::now();

        enabler.start(&mut transport, &[TEMP, PRES], now);
        let EnableProgress::Finished(summary) =
            enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now)
        else {
            panic!("chain should halt at humidity");
        };
        assert_eq!(
            summary.failure(),
            Some((
                MeasurementChannel::Humidity,
                EnableFailure::CharacteristicMissing
            ))
        );
        assert_eq!(transport.descriptor_writes(), vec![TEMP]);
    }

    #[test]
    fn test_duplicate_and_foreign_acks_ignored() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        let now = Instant::now();

        enabler.start(&mut transport, &all(), now);
        assert_eq!(
            enabler.on_descriptor_written(&mut transport, HUM, GATT_SUCCESS, now),
            EnableProgress::Ignored
        );
        assert_eq!(
            enabler.on_descriptor_written(&mut transport, Uuid::nil(), GATT_SUCCESS, now),
            EnableProgress::Ignored
        );

        enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now);
        assert_eq!(
            enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now),
            EnableProgress::Ignored
        );
        assert_eq!(transport.descriptor_writes(), vec![TEMP, HUM]);
    }

    #[test]
    fn test_deadline_fails_stalled_write() {
        let mut transport = RecordingTransport::new();
        let mut enabler = enabler();
        let now = Instant::now();

        enabler.start(&mut transport, &all(), now);
        let deadline = enabler.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_secs(2));

        assert_eq!(
            enabler.on_deadline(&mut transport, now + Duration::from_secs(1)),
            EnableProgress::Ignored
        );

        let EnableProgress::Finished(summary) = enabler.on_deadline(&mut transport, deadline)
        else {
            panic!("stalled write should fail");
        };
        assert_eq!(
            summary.failure(),
            Some((MeasurementChannel::Temperature, EnableFailure::TimedOut))
        );

        // A late acknowledgment after the timeout is a no-op.
        assert_eq!(
            enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, deadline),
            EnableProgress::Ignored
        );
    }

    #[test]
    fn test_permission_revoked_mid_chain() {
        let flag = Arc::new(AuthorizationFlag::new(true));
        let mut enabler = NotificationEnabler::new(Duration::from_secs(2), flag.clone());
        let mut transport = RecordingTransport::new();
        let now = Instant::now();

        enabler.start(&mut transport, &all(), now);
        flag.revoke();

        let EnableProgress::Finished(summary) =
            enabler.on_descriptor_written(&mut transport, TEMP, GATT_SUCCESS, now)
        else {
            panic!("chain should stop");
        };
        assert_eq!(
            summary.failure(),
            Some((MeasurementChannel::Humidity, EnableFailure::PermissionDenied))
        );
        assert_eq!(transport.descriptor_writes(), vec![TEMP]);
    }
}
