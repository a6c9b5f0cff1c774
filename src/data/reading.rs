//! Decoded sensor readings.

use chrono::{DateTime, Utc};

use super::MeasurementChannel;

/// A single decoded value for one channel.
///
/// Readings are immutable once produced. Values are in the channel's
/// published unit (see [`MeasurementChannel::unit`]).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    /// Channel the value belongs to.
    pub channel: MeasurementChannel,
    /// Decoded numeric value.
    pub value: f64,
    /// When the payload was decoded.
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading observed now.
    pub fn new(channel: MeasurementChannel, value: f64) -> Self {
        Self::observed(channel, value, Utc::now())
    }

    /// Create a reading with an explicit observation time.
    pub fn observed(channel: MeasurementChannel, value: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            value,
            observed_at,
        }
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:.2} {}", self.channel, self.value, self.channel.unit())
    }
}

/// Latest value of every channel, as shown on a gauge screen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorSnapshot {
    /// Temperature in degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    /// Pressure in hectopascals.
    pub pressure: Option<f64>,
}

impl SensorSnapshot {
    /// Build a snapshot from per-channel latest readings.
    pub fn from_latest(latest: &[Option<Reading>; MeasurementChannel::COUNT]) -> Self {
        let value = |channel: MeasurementChannel| latest[channel.index()].map(|r| r.value);
        Self {
            temperature: value(MeasurementChannel::Temperature),
            humidity: value(MeasurementChannel::Humidity),
            pressure: value(MeasurementChannel::Pressure),
        }
    }

    /// Value for a single channel.
    pub fn get(&self, channel: MeasurementChannel) -> Option<f64> {
        match channel {
            MeasurementChannel::Temperature => self.temperature,
            MeasurementChannel::Humidity => self.humidity,
            MeasurementChannel::Pressure => self.pressure,
        }
    }

    /// Whether every channel has reported at least once.
    pub fn is_complete(&self) -> bool {
        MeasurementChannel::ALL
            .iter()
            .all(|channel| self.get(*channel).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_display() {
        let reading = Reading::new(MeasurementChannel::Pressure, 1013.25);
        assert_eq!(reading.to_string(), "pressure: 1013.25 hPa");
    }

    #[test]
    fn test_snapshot_from_latest() {
        let mut latest = [None; MeasurementChannel::COUNT];
        latest[MeasurementChannel::Humidity.index()] =
            Some(Reading::new(MeasurementChannel::Humidity, 41.0));

        let snapshot = SensorSnapshot::from_latest(&latest);
        assert_eq!(snapshot.temperature, None);
        assert_eq!(snapshot.humidity, Some(41.0));
        assert_eq!(snapshot.get(MeasurementChannel::Humidity), Some(41.0));
        assert!(!snapshot.is_complete());
    }

    #[test]
    fn test_snapshot_complete() {
        let snapshot = SensorSnapshot {
            temperature: Some(21.0),
            humidity: Some(40.0),
            pressure: Some(1000.0),
        };
        assert!(snapshot.is_complete());
        assert!(!SensorSnapshot::default().is_complete());
    }
}
