//! Data structures for sensor data.
//!
//! This module contains the value types shared by the scanner, the
//! connection state machine and the reading publisher.

pub mod channel;
pub mod device;
pub mod reading;

pub use channel::MeasurementChannel;
pub use device::{Device, DiscoveredDevice};
pub use reading::{Reading, SensorSnapshot};
