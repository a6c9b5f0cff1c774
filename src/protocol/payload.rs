//! Measurement payload decoding.
//!
//! The sensor firmware sends each value as a short ASCII string, for
//! example `"23.5"` or `"23.5°C"`. Everything except decimal digits, `.`
//! and `-` is stripped before parsing. Pressure arrives in pascals and is
//! published in hectopascals.

use chrono::{DateTime, Utc};

use crate::data::{MeasurementChannel, Reading};
use crate::error::{Error, Result};

/// Pascals per hectopascal.
const PASCALS_PER_HECTOPASCAL: f64 = 100.0;

/// Remove every character that cannot be part of a decimal number.
fn clean(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

/// Decode a payload into the channel's published value.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] if no finite number can be parsed.
///
/// # Example
///
/// ```
/// use envsense_ble::data::MeasurementChannel;
/// use envsense_ble::protocol::decode_value;
///
/// let value = decode_value(MeasurementChannel::Pressure, b"101325").unwrap();
/// assert!((value - 1013.25).abs() < 1e-9);
/// ```
pub fn decode_value(channel: MeasurementChannel, payload: &[u8]) -> Result<f64> {
    let text = String::from_utf8_lossy(payload);
    let cleaned = clean(&text);

    let raw: f64 = cleaned
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or(Error::MalformedPayload { channel })?;

    Ok(match channel {
        MeasurementChannel::Temperature | MeasurementChannel::Humidity => raw,
        MeasurementChannel::Pressure => raw / PASCALS_PER_HECTOPASCAL,
    })
}

/// Decode a payload into a [`Reading`] stamped with `observed_at`.
pub fn decode_reading(
    channel: MeasurementChannel,
    payload: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<Reading> {
    let value = decode_value(channel, payload)?;
    Ok(Reading::observed(channel, value, observed_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_temperature_with_unit_suffix() {
        let value = decode_value(MeasurementChannel::Temperature, "23.5°C".as_bytes()).unwrap();
        assert!((value - 23.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_pressure_converts_to_hectopascals() {
        let value = decode_value(MeasurementChannel::Pressure, b"101325").unwrap();
        assert!((value - 1013.25).abs() < 1e-9);
    }

    #[test]
    fn test_decode_humidity_passthrough() {
        let value = decode_value(MeasurementChannel::Humidity, b"RH 45.2 %").unwrap();
        assert!((value - 45.2).abs() < 1e-9);
    }

    #[test]
    fn test_decode_negative_temperature() {
        let value = decode_value(MeasurementChannel::Temperature, b"-7.25").unwrap();
        assert!((value + 7.25).abs() < 1e-9);
    }

    #[test]
    fn test_decode_malformed() {
        for payload in [&b"abc"[..], b"", b"--", b"1.2.3", b"12-3", b"."] {
            let err = decode_value(MeasurementChannel::Temperature, payload).unwrap_err();
            assert!(
                matches!(
                    err,
                    Error::MalformedPayload {
                        channel: MeasurementChannel::Temperature
                    }
                ),
                "payload {:?} gave {:?}",
                payload,
                err
            );
        }
    }

    #[test]
    fn test_decode_invalid_utf8_is_tolerated() {
        let value = decode_value(MeasurementChannel::Humidity, &[0xFF, b'5', b'0', 0xFE]).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_overflow_is_malformed() {
        let huge = "9".repeat(400);
        assert!(decode_value(MeasurementChannel::Pressure, huge.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_reading_stamps_channel_and_time() {
        let now = Utc::now();
        let reading = decode_reading(MeasurementChannel::Humidity, b"40", now).unwrap();
        assert_eq!(reading.channel, MeasurementChannel::Humidity);
        assert_eq!(reading.observed_at, now);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            for channel in MeasurementChannel::ALL {
                let _ = decode_value(channel, &payload);
            }
        }

        #[test]
        fn prop_decimal_text_decodes(value in -10_000.0f64..10_000.0, suffix in "[a-zA-Z %°]{0,4}") {
            let payload = format!("{:.3}{}", value, suffix);
            let expected: f64 = format!("{:.3}", value).parse().unwrap();

            let temperature = decode_value(MeasurementChannel::Temperature, payload.as_bytes()).unwrap();
            prop_assert!((temperature - expected).abs() < 1e-9);

            let pressure = decode_value(MeasurementChannel::Pressure, payload.as_bytes()).unwrap();
            prop_assert!((pressure - expected / 100.0).abs() < 1e-9);
        }
    }
}
