//! BLE backend trait definition

use tokio::sync::mpsc;
use trait_variant::make;
use uuid::Uuid;

use crate::core::error::BackendResult;
use crate::core::types::{CharacteristicHandle, DeviceId, DiscoveredDevice, GattService};

/// Devices reported while a scan is running
pub type DiscoveryReceiver = mpsc::UnboundedReceiver<DiscoveredDevice>;

/// Value changes of a subscribed characteristic
pub type NotificationReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Fires once the peripheral drops the connection
pub type DisconnectReceiver = mpsc::UnboundedReceiver<()>;

/// Abstraction over the central-role BLE stack (typically BlueZ)
///
/// Event sources are returned as channels; dropping a receiver unregisters
/// the observer. Calls are cancelled by dropping their future.
#[make(Send)]
pub trait BleBackend: Send + Sync + 'static {
    /// Start discovery for peripherals advertising `service`
    async fn start_scan(&self, service: Uuid) -> BackendResult<DiscoveryReceiver>;

    /// Stop a running discovery; a no-op when none is active
    async fn stop_scan(&self) -> BackendResult<()>;

    /// Open a connection to the peripheral
    async fn connect(&self, device: &DeviceId) -> BackendResult<()>;

    /// Close the connection to the peripheral
    async fn disconnect(&self, device: &DeviceId) -> BackendResult<()>;

    /// Observe unexpected disconnection of the peripheral
    async fn watch_disconnect(&self, device: &DeviceId) -> BackendResult<DisconnectReceiver>;

    /// Enumerate the GATT services and characteristics of a connected peripheral
    async fn services(&self, device: &DeviceId) -> BackendResult<Vec<GattService>>;

    /// Write a value to a characteristic (with response)
    async fn write(&self, characteristic: &CharacteristicHandle, value: &[u8])
    -> BackendResult<()>;

    /// Enable value-change notifications on a characteristic
    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BackendResult<NotificationReceiver>;

    /// Disable value-change notifications on a characteristic
    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> BackendResult<()>;
}
