//! LinkedLamp Provisioner
//!
//! Finds LinkedLamp devices over Bluetooth Low Energy and provisions them with
//! WiFi credentials through their GATT provisioning service.

pub mod backend;
pub mod config;
pub mod core;
pub mod protocol;

pub use crate::core::{
    client::ProvisioningClient,
    error::{BackendError, CredentialError, ProtocolError, ProvisioningError},
    types::{DeviceId, DiscoveredDevice, ProvisionOutcome, ProvisioningContext},
};
