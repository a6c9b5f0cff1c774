//! Protocol module for decoding sensor payloads.
//!
//! This module contains the implementation for turning raw characteristic
//! values into typed readings.

pub mod payload;

pub use payload::{decode_reading, decode_value};
