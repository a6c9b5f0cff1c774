//! Error types for the envsense-ble crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;
use crate::ble::transport::ConnectionStatus;
use crate::ble::uuids::ENVIRONMENT_SERVICE_UUID;
use crate::data::MeasurementChannel;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The transport capability required for the operation has not been granted.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The requested device is not in the discovered device list.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a ready connection but the sensor is not connected.
    #[error("Sensor not connected")]
    NotConnected,

    /// The operation is not allowed in the current connection state.
    #[error("Operation not allowed while {state}")]
    InvalidState {
        /// The connection state at the time of the request.
        state: ConnectionState,
    },

    /// The transport reported a failed connection attempt.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Classified transport status.
        reason: ConnectionStatus,
    },

    /// Service discovery completed with a non-success status.
    #[error("Service discovery failed with status {status}")]
    ServiceDiscoveryFailed {
        /// Raw GATT status code.
        status: i32,
    },

    /// The environmental service is not offered by the peer.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Enabling notifications for a channel failed.
    #[error("Failed to enable notifications for {channel}")]
    DescriptorWriteFailed {
        /// The channel that stays without live updates.
        channel: MeasurementChannel,
    },

    /// A payload could not be decoded into a number.
    #[error("Malformed {channel} payload")]
    MalformedPayload {
        /// The channel the payload arrived on.
        channel: MeasurementChannel,
    },

    /// Device discovery was stopped by a transport error.
    #[error("Scan failed with code {code}")]
    ScanFailed {
        /// Platform error code.
        code: i32,
    },

    /// The requested operation is not supported by the backend.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The failure kind published on the status stream for this error, if any.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::PermissionDenied => Some(FailureKind::PermissionDenied),
            Self::ConnectionFailed { reason } => Some(FailureKind::ConnectionFailed(*reason)),
            Self::ServiceDiscoveryFailed { status } => {
                Some(FailureKind::ServiceDiscoveryFailed(*status))
            }
            Self::ServiceNotFound { .. } => Some(FailureKind::ServiceNotFound),
            Self::DescriptorWriteFailed { channel } => {
                Some(FailureKind::DescriptorWriteFailed(*channel))
            }
            Self::MalformedPayload { channel } => Some(FailureKind::MalformedPayload(*channel)),
            Self::ScanFailed { code } => Some(FailureKind::ScanFailed(*code)),
            _ => None,
        }
    }
}

/// Copyable classification of the failures the core reports.
///
/// Carried by [`ConnectionState::Error`] and by status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Transport capability not granted.
    PermissionDenied,
    /// Connection attempt failed with the given status.
    ConnectionFailed(ConnectionStatus),
    /// Service discovery returned a non-success status.
    ServiceDiscoveryFailed(i32),
    /// The environmental service is missing on the peer.
    ServiceNotFound,
    /// A channel's notification setup failed.
    DescriptorWriteFailed(MeasurementChannel),
    /// A channel's payload could not be decoded.
    MalformedPayload(MeasurementChannel),
    /// Discovery stopped with a platform error code.
    ScanFailed(i32),
}

impl From<FailureKind> for Error {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::PermissionDenied => Error::PermissionDenied,
            FailureKind::ConnectionFailed(reason) => Error::ConnectionFailed { reason },
            FailureKind::ServiceDiscoveryFailed(status) => Error::ServiceDiscoveryFailed { status },
            FailureKind::ServiceNotFound => Error::ServiceNotFound {
                uuid: ENVIRONMENT_SERVICE_UUID.to_string(),
            },
            FailureKind::DescriptorWriteFailed(channel) => Error::DescriptorWriteFailed { channel },
            FailureKind::MalformedPayload(channel) => Error::MalformedPayload { channel },
            FailureKind::ScanFailed(code) => Error::ScanFailed { code },
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Error::from(*self))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
