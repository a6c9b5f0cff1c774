//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains all UUID constants used for environmental sensor communication.
//! These must match the peripheral firmware exactly.

use uuid::Uuid;

// Environmental Sensing Service (custom)
/// Environmental sensor service UUID.
pub const ENVIRONMENT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
/// Temperature characteristic UUID (Read, Notify).
pub const TEMPERATURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);
/// Humidity characteristic UUID (Read, Notify).
pub const HUMIDITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a9);
/// Pressure characteristic UUID (Read, Notify).
pub const PRESSURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26aa);

// Standard descriptors
/// Client Characteristic Configuration Descriptor (0x2902).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value disabling notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Check if a service UUID is the environmental sensor service.
pub fn is_environment_service(uuid: &Uuid) -> bool {
    *uuid == ENVIRONMENT_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            ENVIRONMENT_SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            TEMPERATURE_CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(
            PRESSURE_CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26aa"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_is_environment_service() {
        assert!(is_environment_service(&ENVIRONMENT_SERVICE_UUID));
        assert!(!is_environment_service(&CCCD_UUID));
    }

    #[test]
    fn test_enable_value_is_little_endian_one() {
        assert_eq!(u16::from_le_bytes(ENABLE_NOTIFICATION_VALUE), 0x0001);
        assert_eq!(u16::from_le_bytes(DISABLE_NOTIFICATION_VALUE), 0x0000);
    }
}
