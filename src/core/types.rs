//! Domain types for LinkedLamp provisioning

use serde::Serialize;
use uuid::Uuid;

use crate::core::error::CredentialError;

/// Longest field the credential frame can carry (one length byte)
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Stable identity of a peripheral as reported by the adapter (BD address on BlueZ)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A peripheral seen during a scan window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Adapter-level identity
    pub id: DeviceId,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Advertised name, if it is not blank
    pub fn advertised_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.trim().is_empty())
    }

    /// Case-sensitive prefix match on the advertised name.
    ///
    /// Devices without a usable name never match, even without a prefix.
    pub fn matches(&self, prefix: Option<&str>) -> bool {
        match (self.advertised_name(), prefix) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(name), Some(prefix)) => name.starts_with(prefix),
        }
    }
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.advertised_name(), self.rssi) {
            (Some(name), Some(rssi)) => write!(f, "{} ({}, {} dBm)", name, self.id, rssi),
            (Some(name), None) => write!(f, "{} ({})", name, self.id),
            (None, _) => write!(f, "{}", self.id),
        }
    }
}

/// Handle to a remote GATT characteristic, valid while the device stays connected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub device: DeviceId,
    pub service_id: u16,
    pub id: u16,
    pub uuid: Uuid,
}

/// Remote GATT service with its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub id: u16,
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicHandle>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicHandle> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Field of the credential frame, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    GroupName,
    Ssid,
    Password,
}

impl std::fmt::Display for CredentialField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CredentialField::GroupName => "group name",
            CredentialField::Ssid => "SSID",
            CredentialField::Password => "password",
        })
    }
}

/// Credentials handed to a lamp, immutable once built
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisioningContext {
    group_name: String,
    ssid: String,
    password: String,
}

impl ProvisioningContext {
    /// Trim and validate the three fields.
    ///
    /// The SSID must not be empty; each field must fit in one length byte once encoded.
    pub fn new(
        group_name: impl AsRef<str>,
        ssid: impl AsRef<str>,
        password: impl AsRef<str>,
    ) -> Result<Self, CredentialError> {
        let group_name = group_name.as_ref().trim().to_string();
        let ssid = ssid.as_ref().trim().to_string();
        let password = password.as_ref().trim().to_string();

        if ssid.is_empty() {
            return Err(CredentialError::EmptySsid);
        }

        for (field, value) in [
            (CredentialField::GroupName, &group_name),
            (CredentialField::Ssid, &ssid),
            (CredentialField::Password, &password),
        ] {
            if value.len() > MAX_FIELD_LEN {
                return Err(CredentialError::FieldTooLong {
                    field,
                    len: value.len(),
                });
            }
        }

        Ok(Self {
            group_name,
            ssid,
            password,
        })
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for ProvisioningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningContext")
            .field("group_name", &self.group_name)
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Keep only the characters lamp firmware accepts in a group name (`[A-Za-z0-9_-]`)
pub fn sanitize_group_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Terminal state of a provisioning call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Lamp acknowledged the credentials
    Provisioned,
    /// Caller cancelled (or the client was reset) before an outcome was known
    Cancelled,
}

impl ProvisionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionOutcome::Cancelled)
    }
}

/// Session identifier, used to correlate log lines of one scan/provision call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
