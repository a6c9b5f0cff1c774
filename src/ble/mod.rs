//! BLE communication module.
//!
//! This module provides the transport abstraction, the btleplug backend and
//! the connection, notification and scanning logic for environmental sensors.

pub mod connection;
pub mod notifications;
pub mod platform;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionConfig, ConnectionState, ConnectionStateMachine};
pub use notifications::{ChannelStatus, EnableFailure, NotificationEnabler};
pub use platform::{BtleplugDiscovery, BtleplugGatt};
pub use scanner::{DeviceScanner, ScanConfig};
pub use transport::{
    ConnectionStatus, DiscoveredService, DiscoveryTransport, GattTransport, LinkState, ScanEvent,
    TransportEvent,
};
pub use uuids::*;
