//! Mock BLE backend for testing

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::backend::ble_backend::{
    BleBackend, DisconnectReceiver, DiscoveryReceiver, NotificationReceiver,
};
use crate::core::error::{BackendError, BackendResult};
use crate::core::types::{CharacteristicHandle, DeviceId, DiscoveredDevice, GattService};
use crate::protocol::{
    CREDENTIALS_CHAR_UUID, Credentials, PROVISIONING_SERVICE_UUID, RESULT_CHAR_UUID,
    decode_credentials,
};

/// Generic Access service, present on every real peripheral
const GAP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
const DEVICE_NAME_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);

/// Backend call recorded by the mock, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartScan(Uuid),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    WatchDisconnect(DeviceId),
    Services(DeviceId),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Write(Uuid, Vec<u8>),
}

/// A peripheral the mock radio advertises
#[derive(Debug, Clone)]
struct Advertisement {
    device: DiscoveredDevice,
    services: Vec<Uuid>,
}

/// Internal state for the mock backend
#[derive(Debug)]
struct MockState {
    advertisements: Vec<Advertisement>,
    discovery_interval: Duration,
    gatt_layout: Vec<(Uuid, Vec<Uuid>)>,
    response: Option<Vec<u8>>,
    response_delay: Duration,
    disconnect_after_write: Option<Duration>,
    connect_delay: Duration,
    should_fail_scan: bool,
    should_fail_connect: bool,
    should_fail_disconnect: bool,
    should_fail_unsubscribe: bool,
    drop_link_on_connect: bool,
    calls: Vec<MockCall>,
    scan_tx: Option<mpsc::UnboundedSender<DiscoveredDevice>>,
    notify_txs: HashMap<CharacteristicHandle, mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_txs: HashMap<DeviceId, mpsc::UnboundedSender<()>>,
    connected: HashSet<DeviceId>,
    active_sessions: usize,
    max_active_sessions: usize,
}

impl MockState {
    fn open_session(&mut self) {
        self.active_sessions += 1;
        self.max_active_sessions = self.max_active_sessions.max(self.active_sessions);
    }

    fn close_session(&mut self) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
    }

    fn drop_link(&mut self, device: &DeviceId) {
        if self.connected.remove(device) {
            self.close_session();
        }
    }

    fn ensure_connected(&self, device: &DeviceId) -> BackendResult<()> {
        if self.connected.contains(device) {
            Ok(())
        } else {
            Err(BackendError::Gatt(format!("{} is not connected", device)))
        }
    }
}

/// Mock BLE backend for testing
///
/// Simulates a radio with advertising lamps and a scriptable provisioning
/// GATT server, and records every call for assertions.
#[derive(Debug, Clone)]
pub struct MockBleBackend {
    inner: Arc<Mutex<MockState>>,
}

impl MockBleBackend {
    /// Create a new mock backend with a lamp-shaped GATT layout and no devices
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                advertisements: vec![],
                discovery_interval: Duration::from_millis(5),
                gatt_layout: vec![
                    (GAP_SERVICE_UUID, vec![DEVICE_NAME_CHAR_UUID]),
                    (
                        PROVISIONING_SERVICE_UUID,
                        vec![CREDENTIALS_CHAR_UUID, RESULT_CHAR_UUID],
                    ),
                ],
                response: None,
                response_delay: Duration::from_millis(10),
                disconnect_after_write: None,
                connect_delay: Duration::ZERO,
                should_fail_scan: false,
                should_fail_connect: false,
                should_fail_disconnect: false,
                should_fail_unsubscribe: false,
                drop_link_on_connect: false,
                calls: vec![],
                scan_tx: None,
                notify_txs: HashMap::new(),
                disconnect_txs: HashMap::new(),
                connected: HashSet::new(),
                active_sessions: 0,
                max_active_sessions: 0,
            })),
        }
    }

    /// Advertise a device exposing the provisioning service
    pub async fn add_device(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        self.add_advertisement(id, name, rssi, vec![PROVISIONING_SERVICE_UUID])
            .await;
    }

    /// Advertise a device with an arbitrary set of service UUIDs
    pub async fn add_advertisement(
        &self,
        id: &str,
        name: Option<&str>,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    ) {
        self.inner.lock().await.advertisements.push(Advertisement {
            device: DiscoveredDevice {
                id: DeviceId::new(id),
                name: name.map(String::from),
                rssi,
            },
            services,
        });
    }

    /// Delay between two discovery events
    pub async fn set_discovery_interval(&self, interval: Duration) {
        self.inner.lock().await.discovery_interval = interval;
    }

    /// Replace the GATT table served by every device (service UUID, characteristic UUIDs)
    pub async fn set_gatt_layout(&self, layout: Vec<(Uuid, Vec<Uuid>)>) {
        self.inner.lock().await.gatt_layout = layout;
    }

    /// Value notified on the result characteristic after a credential write
    ///
    /// `None` means the lamp never answers.
    pub async fn set_response(&self, response: Option<Vec<u8>>) {
        self.inner.lock().await.response = response;
    }

    pub async fn set_response_delay(&self, delay: Duration) {
        self.inner.lock().await.response_delay = delay;
    }

    /// Drop the link this long after a credential write
    pub async fn set_disconnect_after_write(&self, delay: Option<Duration>) {
        self.inner.lock().await.disconnect_after_write = delay;
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().await.connect_delay = delay;
    }

    /// Configure mock to fail scan operations
    pub async fn set_scan_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_scan = should_fail;
    }

    /// Configure mock to fail connect operations
    pub async fn set_connect_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_connect = should_fail;
    }

    /// Configure mock to fail disconnect operations
    pub async fn set_disconnect_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_disconnect = should_fail;
    }

    /// Configure mock to fail unsubscribe operations
    pub async fn set_unsubscribe_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_unsubscribe = should_fail;
    }

    /// Drop the link as soon as a connection is established
    pub async fn set_drop_link_on_connect(&self, drop_link: bool) {
        self.inner.lock().await.drop_link_on_connect = drop_link;
    }

    /// Push a value to every subscriber of `uuid` on `device`
    ///
    /// Returns the number of subscribers reached.
    pub async fn notify(&self, device: &DeviceId, uuid: Uuid, value: Vec<u8>) -> usize {
        let state = self.inner.lock().await;
        state
            .notify_txs
            .iter()
            .filter(|(handle, _)| &handle.device == device && handle.uuid == uuid)
            .filter(|(_, tx)| tx.send(value.clone()).is_ok())
            .count()
    }

    /// Simulate the peripheral dropping the link
    pub async fn trigger_disconnect(&self, device: &DeviceId) {
        let mut state = self.inner.lock().await;
        if let Some(tx) = state.disconnect_txs.get(device) {
            let _ = tx.send(());
        }
        state.drop_link(device);
    }

    /// All recorded calls, oldest first
    pub async fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Values written to characteristics with the given UUID
    pub async fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Write(target, value) if *target == uuid => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Credential frames written to the lamp, decoded the way the firmware reads them
    pub async fn received_credentials(&self) -> Vec<Credentials> {
        self.writes_to(CREDENTIALS_CHAR_UUID)
            .await
            .iter()
            .filter_map(|frame| decode_credentials(frame).ok())
            .collect()
    }

    /// Number of disconnect calls made by the client
    pub async fn disconnect_calls(&self) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Disconnect(_)))
            .count()
    }

    /// Highest number of simultaneously open scans and connections
    pub async fn max_active_sessions(&self) -> usize {
        self.inner.lock().await.max_active_sessions
    }

    /// Observers (discovery, notification, disconnect) whose receiver is still alive
    pub async fn open_observers(&self) -> usize {
        let state = self.inner.lock().await;
        let scan = state.scan_tx.iter().filter(|tx| !tx.is_closed()).count();
        let notify = state.notify_txs.values().filter(|tx| !tx.is_closed()).count();
        let disconnect = state
            .disconnect_txs
            .values()
            .filter(|tx| !tx.is_closed())
            .count();
        scan + notify + disconnect
    }

    pub async fn is_connected(&self, device: &DeviceId) -> bool {
        self.inner.lock().await.connected.contains(device)
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.lock().await.scan_tx.is_some()
    }

    fn schedule_after_write(
        &self,
        device: DeviceId,
        response: Option<(Vec<u8>, Duration)>,
        disconnect: Option<Duration>,
    ) {
        if let Some((value, delay)) = response {
            let mock = self.clone();
            let device = device.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                mock.notify(&device, RESULT_CHAR_UUID, value).await;
            });
        }

        if let Some(delay) = disconnect {
            let mock = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                mock.trigger_disconnect(&device).await;
            });
        }
    }
}

impl Default for MockBleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BleBackend for MockBleBackend {
    async fn start_scan(&self, service: Uuid) -> BackendResult<DiscoveryReceiver> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::StartScan(service));

        if state.should_fail_scan {
            return Err(BackendError::ScanFailed("Mock scan failure".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if state.scan_tx.replace(tx.clone()).is_none() {
            state.open_session();
        }

        let matching: Vec<DiscoveredDevice> = state
            .advertisements
            .iter()
            .filter(|ad| ad.services.contains(&service))
            .map(|ad| ad.device.clone())
            .collect();
        let interval = state.discovery_interval;

        tokio::spawn(async move {
            for device in matching {
                tokio::time::sleep(interval).await;
                if tx.send(device).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn stop_scan(&self) -> BackendResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::StopScan);
        if state.scan_tx.take().is_some() {
            state.close_session();
        }
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> BackendResult<()> {
        let delay = {
            let mut state = self.inner.lock().await;
            state.calls.push(MockCall::Connect(device.clone()));
            if state.should_fail_connect {
                return Err(BackendError::ConnectionFailed("Mock connect failure".into()));
            }
            state.connect_delay
        };

        tokio::time::sleep(delay).await;

        let mut state = self.inner.lock().await;
        if state.connected.insert(device.clone()) {
            state.open_session();
        }
        if state.drop_link_on_connect {
            if let Some(tx) = state.disconnect_txs.get(device) {
                let _ = tx.send(());
            }
            state.drop_link(device);
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> BackendResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::Disconnect(device.clone()));
        if state.should_fail_disconnect {
            return Err(BackendError::Ble("Mock disconnect failure".into()));
        }
        state.disconnect_txs.remove(device);
        state.drop_link(device);
        Ok(())
    }

    async fn watch_disconnect(&self, device: &DeviceId) -> BackendResult<DisconnectReceiver> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::WatchDisconnect(device.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        state.disconnect_txs.insert(device.clone(), tx);
        Ok(rx)
    }

    async fn services(&self, device: &DeviceId) -> BackendResult<Vec<GattService>> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::Services(device.clone()));
        state.ensure_connected(device)?;

        let mut next_id = 1u16;
        let services = state
            .gatt_layout
            .iter()
            .map(|(service_uuid, characteristics)| {
                let service_id = next_id;
                next_id += 1;
                let characteristics = characteristics
                    .iter()
                    .map(|uuid| {
                        let id = next_id;
                        next_id += 1;
                        CharacteristicHandle {
                            device: device.clone(),
                            service_id,
                            id,
                            uuid: *uuid,
                        }
                    })
                    .collect();
                GattService {
                    id: service_id,
                    uuid: *service_uuid,
                    characteristics,
                }
            })
            .collect();

        Ok(services)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> BackendResult<()> {
        let mut state = self.inner.lock().await;
        state
            .calls
            .push(MockCall::Write(characteristic.uuid, value.to_vec()));
        state.ensure_connected(&characteristic.device)?;

        let known = state
            .gatt_layout
            .iter()
            .any(|(_, chars)| chars.contains(&characteristic.uuid));
        if !known {
            return Err(BackendError::UnknownCharacteristic(characteristic.uuid));
        }

        if characteristic.uuid == CREDENTIALS_CHAR_UUID {
            let response = state
                .response
                .clone()
                .map(|value| (value, state.response_delay));
            let disconnect = state.disconnect_after_write;
            drop(state);
            self.schedule_after_write(characteristic.device.clone(), response, disconnect);
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> BackendResult<NotificationReceiver> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::Subscribe(characteristic.uuid));
        state.ensure_connected(&characteristic.device)?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.notify_txs.insert(characteristic.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> BackendResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::Unsubscribe(characteristic.uuid));
        if state.should_fail_unsubscribe {
            return Err(BackendError::Gatt("Mock unsubscribe failure".into()));
        }
        state.notify_txs.remove(characteristic);
        Ok(())
    }
}
