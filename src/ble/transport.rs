//! Transport abstraction.
//!
//! The GATT transport is callback driven: every request returns immediately
//! and its outcome arrives later as a [`TransportEvent`]. The connection
//! state machine only talks to the radio through [`GattTransport`], and the
//! scanner through [`DiscoveryTransport`], so both can be driven by a
//! platform backend or by a test double.

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::data::Device;
use crate::error::Result;

/// GATT status: operation succeeded.
pub const GATT_SUCCESS: i32 = 0;
/// GATT status: connection supervision timeout.
pub const GATT_CONN_TIMEOUT: i32 = 8;
/// GATT status: remote user terminated the connection.
pub const GATT_CONN_TERMINATE_PEER_USER: i32 = 19;
/// GATT status: generic error, usually authentication or authorization.
pub const GATT_ERROR: i32 = 133;
/// GATT status: unspecified failure.
pub const GATT_FAILURE: i32 = 257;

/// Classified connection status reported with link state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionStatus {
    /// The operation completed successfully.
    Success,
    /// Authentication failure or insufficient authorization.
    AuthFailure,
    /// The link supervision timer expired.
    Timeout,
    /// The peer terminated the connection.
    PeerTerminated,
    /// Any other status code.
    Unknown(i32),
}

impl ConnectionStatus {
    /// Map a raw GATT status code onto the taxonomy.
    pub fn from_code(code: i32) -> Self {
        match code {
            GATT_SUCCESS => Self::Success,
            GATT_ERROR => Self::AuthFailure,
            GATT_CONN_TIMEOUT => Self::Timeout,
            GATT_CONN_TERMINATE_PEER_USER => Self::PeerTerminated,
            other => Self::Unknown(other),
        }
    }

    /// Check if this is a success status.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::AuthFailure => write!(f, "authentication failure ({})", GATT_ERROR),
            Self::Timeout => write!(f, "connection timeout ({})", GATT_CONN_TIMEOUT),
            Self::PeerTerminated => {
                write!(f, "terminated by peer ({})", GATT_CONN_TERMINATE_PEER_USER)
            }
            Self::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}

/// Link-layer state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Link is down.
    Disconnected,
    /// Link is being established.
    Connecting,
    /// Link is up.
    Connected,
    /// Link is being torn down.
    Disconnecting,
}

/// A GATT service as seen after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristics in this service.
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    /// Create a service record.
    pub fn new(uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }
}

/// Asynchronous outcome delivered by a [`GattTransport`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link changed state, or a connection attempt completed.
    ConnectionStateChanged {
        /// Raw GATT status code.
        status: i32,
        /// New link state.
        link: LinkState,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Raw GATT status code.
        status: i32,
        /// Services offered by the peer.
        services: Vec<DiscoveredService>,
    },
    /// A descriptor write was acknowledged by the peer.
    DescriptorWritten {
        /// Characteristic owning the descriptor.
        characteristic: Uuid,
        /// Raw GATT status code.
        status: i32,
    },
    /// The peer pushed a notification.
    CharacteristicChanged {
        /// Source characteristic.
        characteristic: Uuid,
        /// Raw value bytes.
        value: Bytes,
    },
    /// An explicit read completed.
    CharacteristicRead {
        /// Source characteristic.
        characteristic: Uuid,
        /// Raw value bytes.
        value: Bytes,
        /// Raw GATT status code.
        status: i32,
    },
}

/// Non-blocking GATT client operations.
///
/// Every method only reports whether the request could be issued. Results
/// are delivered later as [`TransportEvent`]s on the channel the transport
/// was created with.
#[cfg_attr(test, mockall::automock)]
pub trait GattTransport: Send {
    /// Start connecting to `device`.
    fn connect(&mut self, device: &Device) -> Result<()>;

    /// Ask for a high-throughput connection interval.
    fn request_high_priority(&mut self) -> Result<()>;

    /// Start service discovery on the open session.
    fn discover_services(&mut self) -> Result<()>;

    /// Enable or disable local delivery of notifications for a characteristic.
    fn set_local_notifications(&mut self, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Start writing `value` to a descriptor of `characteristic`.
    fn write_descriptor(&mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8])
        -> Result<()>;

    /// Start reading a characteristic value.
    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<()>;

    /// Start tearing down the link.
    fn disconnect(&mut self) -> Result<()>;

    /// Release every resource held for the session.
    fn close(&mut self);
}

/// Event delivered by a [`DiscoveryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A device advertisement was received.
    Discovered {
        /// Transport address.
        address: String,
        /// Advertised local name.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// The platform aborted discovery.
    Failed {
        /// Platform error code.
        code: i32,
    },
}

/// Platform-level device discovery.
pub trait DiscoveryTransport: Send + Sync {
    /// Begin unfiltered discovery, reporting sightings on `events`.
    fn start_discovery(&self, events: mpsc::UnboundedSender<ScanEvent>) -> Result<()>;

    /// End discovery.
    fn stop_discovery(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport doubles shared by unit tests.

    use std::collections::HashSet;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    /// A call made against [`RecordingTransport`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Connect(String),
        RequestHighPriority,
        DiscoverServices,
        SetLocalNotifications(Uuid, bool),
        WriteDescriptor(Uuid, Uuid, Vec<u8>),
        ReadCharacteristic(Uuid),
        Disconnect,
        Close,
    }

    /// Failure switches for [`RecordingTransport`].
    #[derive(Debug, Default)]
    pub struct Failures {
        pub connect: bool,
        pub discover: bool,
        pub local_enable: HashSet<Uuid>,
        pub write_descriptor: HashSet<Uuid>,
    }

    /// Transport that records every call and succeeds unless told otherwise.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingTransport {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub failures: Arc<Mutex<Failures>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().clear();
        }

        /// Characteristics whose CCCD write was issued, in order.
        pub fn descriptor_writes(&self) -> Vec<Uuid> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::WriteDescriptor(uuid, _, _) => Some(uuid),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }

        fn refused(what: &str) -> Error {
            Error::Internal(format!("{} refused", what))
        }
    }

    impl GattTransport for RecordingTransport {
        fn connect(&mut self, device: &Device) -> Result<()> {
            self.record(Call::Connect(device.address().to_string()));
            if self.failures.lock().connect {
                return Err(Self::refused("connect"));
            }
            Ok(())
        }

        fn request_high_priority(&mut self) -> Result<()> {
            self.record(Call::RequestHighPriority);
            Err(Error::NotSupported {
                operation: "connection priority".to_string(),
            })
        }

        fn discover_services(&mut self) -> Result<()> {
            self.record(Call::DiscoverServices);
            if self.failures.lock().discover {
                return Err(Self::refused("discover"));
            }
            Ok(())
        }

        fn set_local_notifications(&mut self, characteristic: Uuid, enabled: bool) -> Result<()> {
            self.record(Call::SetLocalNotifications(characteristic, enabled));
            if enabled && self.failures.lock().local_enable.contains(&characteristic) {
                return Err(Self::refused("local enable"));
            }
            Ok(())
        }

        fn write_descriptor(
            &mut self,
            characteristic: Uuid,
            descriptor: Uuid,
            value: &[u8],
        ) -> Result<()> {
            self.record(Call::WriteDescriptor(
                characteristic,
                descriptor,
                value.to_vec(),
            ));
            if self.failures.lock().write_descriptor.contains(&characteristic) {
                return Err(Self::refused("descriptor write"));
            }
            Ok(())
        }

        fn read_characteristic(&mut self, characteristic: Uuid) -> Result<()> {
            self.record(Call::ReadCharacteristic(characteristic));
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.record(Call::Disconnect);
            Ok(())
        }

        fn close(&mut self) {
            self.record(Call::Close);
        }
    }

    /// Discovery transport driven by the test.
    #[derive(Debug, Default)]
    pub struct ScriptedDiscovery {
        pub sender: Mutex<Option<mpsc::UnboundedSender<ScanEvent>>>,
        pub starts: Mutex<u32>,
        pub stops: Mutex<u32>,
        pub refuse: bool,
    }

    impl ScriptedDiscovery {
        pub fn emit(&self, event: ScanEvent) {
            if let Some(tx) = self.sender.lock().as_ref() {
                let _ = tx.send(event);
            }
        }

        pub fn seen(&self, address: &str, name: Option<&str>, rssi: i16) {
            self.emit(ScanEvent::Discovered {
                address: address.to_string(),
                name: name.map(str::to_string),
                rssi,
            });
        }

        pub fn starts(&self) -> u32 {
            *self.starts.lock()
        }

        pub fn stops(&self) -> u32 {
            *self.stops.lock()
        }
    }

    impl DiscoveryTransport for ScriptedDiscovery {
        fn start_discovery(&self, events: mpsc::UnboundedSender<ScanEvent>) -> Result<()> {
            if self.refuse {
                return Err(Error::BluetoothUnavailable);
            }
            *self.starts.lock() += 1;
            *self.sender.lock() = Some(events);
            Ok(())
        }

        fn stop_discovery(&self) -> Result<()> {
            *self.stops.lock() += 1;
            Ok(())
        }
    }
}
