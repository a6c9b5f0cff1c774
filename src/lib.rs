// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # envsense-ble
//!
//! A cross-platform Rust library for reading temperature, humidity and
//! pressure from an environmental sensor over Bluetooth Low Energy.
//!
//! The sensor exposes one GATT service with three characteristics that
//! stream ASCII-encoded numbers. This library discovers nearby sensors,
//! connects to one, enables notifications for each channel in order and
//! publishes the decoded readings.
//!
//! ## Features
//!
//! - **Device Discovery**: Time-bounded scan producing a deduplicated candidate list
//! - **Ordered Setup**: Notifications enabled one channel at a time
//! - **Fault Containment**: A failed channel never takes the connection down
//! - **Latest Values**: Per-channel readings, state and status as subscribable streams
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use envsense_ble::{DeviceManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create device manager and start scanning
//!     let manager = DeviceManager::new().await?;
//!     manager.start_scanning().await?;
//!
//!     // Wait for sensors to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Connect to the strongest one
//!     if let Some(candidate) = manager.devices_by_signal().first() {
//!         manager.select_device(candidate.address()).await?;
//!
//!         let mut state = manager.subscribe_state();
//!         state.wait_for(|s| s.is_connected()).await.ok();
//!
//!         let snapshot = manager.snapshot();
//!         if let Some(temperature) = snapshot.temperature {
//!             println!("Temperature: {:.1}°C", temperature);
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod authorization;
pub mod ble;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod sensor;
pub mod utils;

// Re-exports for convenience
pub use authorization::{Authorization, AuthorizationFlag, Granted};
pub use device_manager::{DeviceManager, ManagerConfig};
pub use error::{Error, FailureKind, Result};
pub use publisher::{ReadingPublisher, StatusEvent};
pub use sensor::{CallbackHandle, SensorConnection};
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius, TemperatureUnit};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionConfig, ConnectionState};
pub use ble::notifications::{ChannelStatus, EnableFailure};
pub use ble::scanner::ScanConfig;
pub use ble::transport::ConnectionStatus;
pub use data::{Device, DiscoveredDevice, MeasurementChannel, Reading, SensorSnapshot};
