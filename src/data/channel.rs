//! Measurement channels exposed by the environmental sensor.

use uuid::Uuid;

use crate::ble::uuids::{
    HUMIDITY_CHARACTERISTIC_UUID, PRESSURE_CHARACTERISTIC_UUID, TEMPERATURE_CHARACTERISTIC_UUID,
};

/// One of the three measurement channels of the sensor.
///
/// Each channel is bound to a fixed GATT characteristic and a decode rule.
/// The declaration order is the order in which notifications are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MeasurementChannel {
    /// Air temperature in degrees Celsius.
    Temperature,
    /// Relative humidity in percent.
    Humidity,
    /// Barometric pressure, published in hectopascals.
    Pressure,
}

impl MeasurementChannel {
    /// Number of channels.
    pub const COUNT: usize = 3;

    /// All channels in notification-enable order.
    pub const ALL: [MeasurementChannel; Self::COUNT] =
        [Self::Temperature, Self::Humidity, Self::Pressure];

    /// Characteristic UUID carrying this channel's values.
    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            Self::Temperature => TEMPERATURE_CHARACTERISTIC_UUID,
            Self::Humidity => HUMIDITY_CHARACTERISTIC_UUID,
            Self::Pressure => PRESSURE_CHARACTERISTIC_UUID,
        }
    }

    /// Look up the channel bound to a characteristic UUID.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.characteristic_uuid() == *uuid)
    }

    /// Stable slot index, used for per-channel arrays.
    pub fn index(&self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
            Self::Pressure => 2,
        }
    }

    /// The channel enabled after this one, if any.
    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Unit of the published value.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
        }
    }
}

impl std::fmt::Display for MeasurementChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Humidity => write!(f, "humidity"),
            Self::Pressure => write!(f, "pressure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_mapping() {
        for channel in MeasurementChannel::ALL {
            assert_eq!(
                MeasurementChannel::from_uuid(&channel.characteristic_uuid()),
                Some(channel)
            );
        }
        assert_eq!(MeasurementChannel::from_uuid(&Uuid::nil()), None);
    }

    #[test]
    fn test_enable_order() {
        assert_eq!(
            MeasurementChannel::Temperature.next(),
            Some(MeasurementChannel::Humidity)
        );
        assert_eq!(
            MeasurementChannel::Humidity.next(),
            Some(MeasurementChannel::Pressure)
        );
        assert_eq!(MeasurementChannel::Pressure.next(), None);
    }

    #[test]
    fn test_index_matches_order() {
        for (i, channel) in MeasurementChannel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn test_display_and_unit() {
        assert_eq!(MeasurementChannel::Pressure.to_string(), "pressure");
        assert_eq!(MeasurementChannel::Pressure.unit(), "hPa");
    }
}
