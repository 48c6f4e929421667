//! BLE backend abstraction layer

pub mod ble_backend;
pub mod bluer_backend;
pub mod mock_backend;

pub use ble_backend::{BleBackend, DisconnectReceiver, DiscoveryReceiver, NotificationReceiver};
pub use bluer_backend::BluerBackend;

#[cfg(test)]
pub use mock_backend::{MockBleBackend, MockCall};
