//! BlueZ backend implementation (central role via bluer)

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, gatt::remote::Characteristic,
};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    backend::ble_backend::{BleBackend, DisconnectReceiver, DiscoveryReceiver, NotificationReceiver},
    core::{
        error::{BackendError, BackendResult},
        types::{CharacteristicHandle, DeviceId, DiscoveredDevice, GattService},
    },
};

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for BackendError {
    fn from(e: bluer::Error) -> Self {
        BackendError::Ble(e.to_string())
    }
}

/// Tasks forwarding bluer event streams into channels
#[derive(Default)]
struct ForwardTasks {
    discovery: Option<JoinHandle<()>>,
    notifications: HashMap<CharacteristicHandle, JoinHandle<()>>,
    watchers: HashMap<DeviceId, JoinHandle<()>>,
}

impl Drop for ForwardTasks {
    fn drop(&mut self) {
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
        for (_, task) in self.notifications.drain() {
            task.abort();
        }
        for (_, task) in self.watchers.drain() {
            task.abort();
        }
    }
}

/// BlueZ central backend
pub struct BluerBackend {
    adapter: Adapter,
    tasks: Mutex<ForwardTasks>,
}

impl BluerBackend {
    /// Open the named adapter (or the default one); it must already be powered
    pub async fn new(adapter_name: Option<&str>) -> BackendResult<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| BackendError::AdapterUnavailable(e.to_string()))?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| BackendError::AdapterUnavailable(e.to_string()))?;

        if !adapter.is_powered().await? {
            return Err(BackendError::AdapterUnavailable(format!(
                "{} is powered off",
                adapter.name()
            )));
        }

        info!("Using BLE adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            tasks: Mutex::new(ForwardTasks::default()),
        })
    }

    fn device(&self, id: &DeviceId) -> BackendResult<Device> {
        let address: Address = id
            .as_str()
            .parse()
            .map_err(|_| BackendError::InvalidDevice(id.to_string()))?;
        Ok(self.adapter.device(address)?)
    }

    async fn characteristic(&self, handle: &CharacteristicHandle) -> BackendResult<Characteristic> {
        let device = self.device(&handle.device)?;
        let service = device.service(handle.service_id).await?;
        Ok(service.characteristic(handle.id).await?)
    }

    /// BlueZ reports the GATT database some time after the link is up
    async fn wait_services_resolved(device: &Device) -> BackendResult<()> {
        let wait = async {
            while !device.is_services_resolved().await? {
                tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
            }
            Ok::<_, BackendError>(())
        };

        tokio::time::timeout(SERVICES_RESOLVE_TIMEOUT, wait)
            .await
            .map_err(|_| BackendError::Gatt("timed out resolving GATT services".into()))?
    }
}

/// Read the current advertisement of a device reported by discovery
async fn describe(
    adapter: &Adapter,
    address: Address,
    service: Uuid,
) -> bluer::Result<Option<DiscoveredDevice>> {
    let device = adapter.device(address)?;
    Ok(advertisement(
        address,
        device.uuids().await?,
        device.name().await?,
        device.rssi().await?,
        service,
    ))
}

/// Keep devices advertising `service` that were heard during this scan.
///
/// BlueZ replays cached devices without an RSSI when discovery starts.
fn advertisement(
    address: Address,
    uuids: Option<HashSet<Uuid>>,
    name: Option<String>,
    rssi: Option<i16>,
    service: Uuid,
) -> Option<DiscoveredDevice> {
    if !uuids.is_some_and(|uuids| uuids.contains(&service)) {
        return None;
    }
    rssi.map(|rssi| DiscoveredDevice {
        id: DeviceId::new(address.to_string()),
        name,
        rssi: Some(rssi),
    })
}

impl BleBackend for BluerBackend {
    async fn start_scan(&self, service: Uuid) -> BackendResult<DiscoveryReceiver> {
        self.stop_scan().await?;

        let filter = DiscoveryFilter {
            uuids: HashSet::from([service]),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(|e| BackendError::ScanFailed(e.to_string()))?;
        // Property changes re-emit DeviceAdded, so later advertisements update RSSI
        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(|e| BackendError::ScanFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match describe(&adapter, address, service).await {
                    Ok(Some(device)) => {
                        if tx.send(device).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Skipping {}: {}", address, e),
                }
            }
            debug!("Discovery stream ended");
        });

        self.tasks.lock().await.discovery = Some(task);
        debug!("Discovery started for service {}", service);
        Ok(rx)
    }

    async fn stop_scan(&self) -> BackendResult<()> {
        if let Some(task) = self.tasks.lock().await.discovery.take() {
            task.abort();
            debug!("Discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> BackendResult<()> {
        self.device(device)?
            .connect()
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self, device: &DeviceId) -> BackendResult<()> {
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(task) = tasks.watchers.remove(device) {
                task.abort();
            }
            tasks.notifications.retain(|handle, task| {
                let keep = &handle.device != device;
                if !keep {
                    task.abort();
                }
                keep
            });
        }

        let peripheral = self.device(device)?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn watch_disconnect(&self, device: &DeviceId) -> BackendResult<DisconnectReceiver> {
        let events = self.device(device)?.events().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = tx.send(());
                    break;
                }
            }
        });

        if let Some(old) = self.tasks.lock().await.watchers.insert(device.clone(), task) {
            old.abort();
        }
        Ok(rx)
    }

    async fn services(&self, device: &DeviceId) -> BackendResult<Vec<GattService>> {
        let peripheral = self.device(device)?;
        Self::wait_services_resolved(&peripheral).await?;

        let mut services = Vec::new();
        for service in peripheral.services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                characteristics.push(CharacteristicHandle {
                    device: device.clone(),
                    service_id: service.id(),
                    id: characteristic.id(),
                    uuid: characteristic.uuid().await?,
                });
            }
            services.push(GattService {
                id: service.id(),
                uuid: service.uuid().await?,
                characteristics,
            });
        }

        debug!("Resolved {} GATT services on {}", services.len(), device);
        Ok(services)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> BackendResult<()> {
        self.characteristic(characteristic)
            .await?
            .write(value)
            .await
            .map_err(|e| BackendError::Gatt(e.to_string()))
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BackendResult<NotificationReceiver> {
        let values = self
            .characteristic(characteristic)
            .await?
            .notify()
            .await
            .map_err(|e| BackendError::Gatt(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut values = std::pin::pin!(values);
            while let Some(value) = values.next().await {
                if tx.send(value).is_err() {
                    break;
                }
            }
        });

        if let Some(old) = self
            .tasks
            .lock()
            .await
            .notifications
            .insert(characteristic.clone(), task)
        {
            old.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> BackendResult<()> {
        if let Some(task) = self
            .tasks
            .lock()
            .await
            .notifications
            .remove(characteristic)
        {
            task.abort();
        }
        Ok(())
    }
}
