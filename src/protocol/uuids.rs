//! GATT identifiers of the LinkedLamp provisioning service

use uuid::Uuid;

/// Provisioning service UUID (advertised by the lamp, used as scan filter)
pub const PROVISIONING_SERVICE_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x01, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Credentials characteristic (write, length-prefixed group/SSID/password frame)
pub const CREDENTIALS_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x02, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Result characteristic (notify, single status byte)
pub const RESULT_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x03, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Name prefix advertised by LinkedLamp firmware
pub const DEFAULT_DEVICE_NAME_PREFIX: &str = "LinkedLamp_Caskev_";
