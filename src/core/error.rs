//! Error types for LinkedLamp provisioning

use thiserror::Error;
use uuid::Uuid;

use super::types::CredentialField;

/// Result type for BLE backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for provisioning client operations
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

/// Errors raised by the BLE transport (adapter-level failures)
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("Invalid device identifier: {0}")]
    InvalidDevice(String),

    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    #[error("BLE error: {0}")]
    Ble(String),
}

/// Errors related to the credential frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("SSID is empty")]
    EmptySsid,

    #[error("{field} is {len} bytes long, at most 255 fit in the frame")]
    FieldTooLong { field: CredentialField, len: usize },

    #[error("Frame truncated while reading {field}")]
    Truncated { field: CredentialField },

    #[error("Frame has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: CredentialField },
}

/// Errors caused by a lamp that does not speak the expected GATT protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Provisioning service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Malformed response: empty result notification")]
    MalformedResponse,
}

/// Failure outcome of a scan or provisioning call
///
/// Cancellation is not represented here; see [`ProvisionOutcome`](super::types::ProvisionOutcome).
#[derive(Error, Debug, Clone)]
pub enum ProvisioningError {
    #[error("Transport error: {0}")]
    Transport(#[from] BackendError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device rejected credentials (status {code:#04x})")]
    Rejected { code: u8 },

    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(#[from] CredentialError),
}

impl ProvisioningError {
    /// True when the BLE link worked but the WiFi credentials need to change
    pub fn is_credentials_problem(&self) -> bool {
        matches!(
            self,
            ProvisioningError::Rejected { .. } | ProvisioningError::InvalidCredentials(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_credentials_problem() {
        assert!(ProvisioningError::Rejected { code: 0 }.is_credentials_problem());
        assert!(ProvisioningError::from(CredentialError::EmptySsid).is_credentials_problem());
        assert!(!ProvisioningError::Disconnected.is_credentials_problem());
        assert!(
            !ProvisioningError::from(ProtocolError::MalformedResponse).is_credentials_problem()
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ProvisioningError::Rejected { code: 0 }.to_string(),
            "Device rejected credentials (status 0x00)"
        );
        assert_eq!(
            CredentialError::FieldTooLong {
                field: CredentialField::Ssid,
                len: 300
            }
            .to_string(),
            "SSID is 300 bytes long, at most 255 fit in the frame"
        );
    }
}
