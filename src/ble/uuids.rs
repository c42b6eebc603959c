//! Well-known attribute UUIDs.
//!
//! Contains the standard descriptor UUIDs used by the GATT server and the
//! smart alert service layout.

use crate::ble::uuid::BleUuid;

// Standard descriptors
/// Client Characteristic Configuration descriptor (notify/indicate control).
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: BleUuid = BleUuid::from_u16(0x2902);
/// Characteristic User Description descriptor.
pub const CHARACTERISTIC_USER_DESCRIPTION_UUID: BleUuid = BleUuid::from_u16(0x2901);

// Smart Alert Service (custom 16-bit)
/// Smart alert configuration service UUID.
pub const ALERT_SERVICE_UUID: BleUuid = BleUuid::from_u16(0xAFFF);
/// Unique ID of the device (read only).
pub const DEVICE_UID_UUID: BleUuid = BleUuid::from_u16(0xAF01);
/// Firmware version (read only).
pub const FIRMWARE_VERSION_UUID: BleUuid = BleUuid::from_u16(0xAF02);
/// Hardware revision (read only).
pub const HARDWARE_REVISION_UUID: BleUuid = BleUuid::from_u16(0xAF03);
/// Device status code (read only).
pub const DEVICE_STATUS_UUID: BleUuid = BleUuid::from_u16(0xAF04);
/// Operation mode: home, guard, alarm, motest (read/write).
pub const OPERATION_MODE_UUID: BleUuid = BleUuid::from_u16(0xAF05);
/// Alarm state and triggering sensor (read only).
pub const ALARM_STATE_UUID: BleUuid = BleUuid::from_u16(0xAF06);
/// Wi-Fi connection state (read only).
pub const WLAN_STATE_UUID: BleUuid = BleUuid::from_u16(0xAF08);
/// Battery status (read only).
pub const BATTERY_STATUS_UUID: BleUuid = BleUuid::from_u16(0xAF09);
/// Wi-Fi access point SSID (read/write).
pub const WLAN_SSID_UUID: BleUuid = BleUuid::from_u16(0xAF0A);
/// Wi-Fi access point password (write only).
pub const WLAN_PASSWORD_UUID: BleUuid = BleUuid::from_u16(0xAF0B);
/// Apply pending configuration (write only).
pub const APPLY_NOW_UUID: BleUuid = BleUuid::from_u16(0xAF0E);

/// Check if a UUID belongs to the smart alert service layout.
pub fn is_alert_attribute(uuid: &BleUuid) -> bool {
    matches!(uuid.as_u16(), Some(0xAF00..=0xAFFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let cccd = CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string();
        assert!(cccd.contains("2902"));

        let service = ALERT_SERVICE_UUID.to_string();
        assert_eq!(service, "0000afff-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_is_alert_attribute() {
        assert!(is_alert_attribute(&ALERT_SERVICE_UUID));
        assert!(is_alert_attribute(&DEVICE_UID_UUID));
        assert!(!is_alert_attribute(&CLIENT_CHARACTERISTIC_CONFIG_UUID));
    }
}
