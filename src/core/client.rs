//! Provisioning client: scan for lamps and hand them WiFi credentials
//!
//! Every call runs under a single-flight gate. The gate owns the session state,
//! so a call can only touch the radio while it holds the gate, and teardown runs
//! on every exit path before the gate is released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{BleBackend, DisconnectReceiver, NotificationReceiver},
    core::{
        cancel::CancelScope,
        error::{BackendError, CredentialError, ProtocolError, ProvisioningError, ProvisioningResult},
        session::Session,
        types::{DeviceId, DiscoveredDevice, ProvisionOutcome, ProvisioningContext},
    },
    protocol::{
        CREDENTIALS_CHAR_UUID, PROVISIONING_SERVICE_UUID, RESULT_CHAR_UUID, ResultStatus,
        encode_context, parse_result,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    CollectAll,
    FirstMatch,
}

/// Why a provisioning run stopped early
#[derive(Debug)]
enum Abort {
    Cancelled,
    Failed(ProvisioningError),
}

impl From<ProvisioningError> for Abort {
    fn from(e: ProvisioningError) -> Self {
        Abort::Failed(e)
    }
}

impl From<BackendError> for Abort {
    fn from(e: BackendError) -> Self {
        Abort::Failed(e.into())
    }
}

impl From<ProtocolError> for Abort {
    fn from(e: ProtocolError) -> Self {
        Abort::Failed(e.into())
    }
}

impl From<CredentialError> for Abort {
    fn from(e: CredentialError) -> Self {
        Abort::Failed(e.into())
    }
}

/// Clears the re-entrancy flag of `cancel_and_reset` on every exit path
struct ResetGuard<'a>(&'a AtomicBool);

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run one backend call unless the scope is cancelled first
async fn step<T, E, F>(scope: &CancelScope, fut: F) -> Result<T, Abort>
where
    F: Future<Output = Result<T, E>>,
    Abort: From<E>,
{
    match scope.run(fut).await {
        Some(result) => result.map_err(Abort::from),
        None => Err(Abort::Cancelled),
    }
}

/// Like [`step`], but a peripheral disconnect also ends the call.
///
/// A disconnect already reported wins over a step that completes at the same time.
async fn guarded<T, E, F>(
    scope: &CancelScope,
    disconnects: &mut DisconnectReceiver,
    fut: F,
) -> Result<T, Abort>
where
    F: Future<Output = Result<T, E>>,
    Abort: From<E>,
{
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(Abort::Cancelled),
        _ = disconnects.recv() => Err(ProvisioningError::Disconnected.into()),
        result = fut => result.map_err(Abort::from),
    }
}

/// Wait for the first result notification.
///
/// A value already received counts even if the lamp dropped the link right after.
async fn await_result(
    scope: &CancelScope,
    disconnects: &mut DisconnectReceiver,
    notifications: &mut NotificationReceiver,
) -> Result<Vec<u8>, Abort> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(Abort::Cancelled),
        value = notifications.recv() => value.ok_or(ProvisioningError::Disconnected.into()),
        _ = disconnects.recv() => Err(ProvisioningError::Disconnected.into()),
    }
}

/// BLE provisioning client for LinkedLamp devices
///
/// Serializes scans and provisioning runs: a second call waits for the gate
/// instead of opening a parallel GATT session.
pub struct ProvisioningClient<B: BleBackend> {
    backend: Arc<B>,
    gate: Mutex<Session>,
    epoch: RwLock<CancellationToken>,
    resetting: AtomicBool,
}

impl<B: BleBackend> ProvisioningClient<B> {
    /// Create a client driving the given BLE backend
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            gate: Mutex::new(Session::default()),
            epoch: RwLock::new(CancellationToken::new()),
            resetting: AtomicBool::new(false),
        }
    }

    /// True while a scan, provisioning run or reset holds the gate
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    async fn scope(&self, caller: CancellationToken) -> CancelScope {
        CancelScope::new(caller, self.epoch.read().await.clone())
    }

    /// Collect lamps whose advertised name starts with `prefix` until `cancel` fires.
    ///
    /// Each device is reported once with its latest advertisement, strongest signal first.
    pub async fn scan(
        &self,
        prefix: Option<&str>,
        cancel: CancellationToken,
    ) -> ProvisioningResult<Vec<DiscoveredDevice>> {
        self.discover(prefix, ScanMode::CollectAll, cancel, None).await
    }

    /// Stop at the first matching lamp; `None` if cancelled before one shows up
    pub async fn scan_first(
        &self,
        prefix: Option<&str>,
        cancel: CancellationToken,
    ) -> ProvisioningResult<Option<DiscoveredDevice>> {
        let devices = self
            .discover(prefix, ScanMode::FirstMatch, cancel, None)
            .await?;
        Ok(devices.into_iter().next())
    }

    /// Scan for a fixed window, counted from the moment the scan gets the gate
    pub async fn scan_for(
        &self,
        prefix: Option<&str>,
        window: Duration,
    ) -> ProvisioningResult<Vec<DiscoveredDevice>> {
        self.discover(
            prefix,
            ScanMode::CollectAll,
            CancellationToken::new(),
            Some(window),
        )
        .await
    }

    async fn discover(
        &self,
        prefix: Option<&str>,
        mode: ScanMode,
        cancel: CancellationToken,
        window: Option<Duration>,
    ) -> ProvisioningResult<Vec<DiscoveredDevice>> {
        let scope = self.scope(cancel).await;
        let Some(mut session) = scope.run(self.gate.lock()).await else {
            debug!("Scan cancelled while waiting for the gate");
            return Ok(Vec::new());
        };
        let (scope, _deadline) = scope.limited(window);

        self.teardown(&mut session).await;
        let id = session.begin(scope.clone());
        session.set_scanning();
        debug!("[{}] Scanning for {:?}", id, prefix.unwrap_or("any name"));

        let result = self.collect(&scope, prefix, mode).await;
        self.teardown(&mut session).await;

        let mut devices = result?;
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        info!("[{}] Scan finished with {} device(s)", id, devices.len());
        Ok(devices)
    }

    async fn collect(
        &self,
        scope: &CancelScope,
        prefix: Option<&str>,
        mode: ScanMode,
    ) -> ProvisioningResult<Vec<DiscoveredDevice>> {
        let Some(started) = scope
            .run(self.backend.start_scan(PROVISIONING_SERVICE_UUID))
            .await
        else {
            return Ok(Vec::new());
        };
        let mut discoveries = started?;
        let mut found: HashMap<DeviceId, DiscoveredDevice> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                next = discoveries.recv() => match next {
                    Some(device) if device.matches(prefix) => {
                        debug!("Found {}", device);
                        found.insert(device.id.clone(), device);
                        if mode == ScanMode::FirstMatch {
                            break;
                        }
                    }
                    Some(device) => debug!("Ignoring {}", device),
                    None => {
                        debug!("Discovery channel closed");
                        break;
                    }
                },
            }
        }

        Ok(found.into_values().collect())
    }

    /// Hand `ctx` to the lamp and wait for its verdict.
    ///
    /// Cancellation through `cancel` or [`cancel_and_reset`](Self::cancel_and_reset)
    /// resolves to [`ProvisionOutcome::Cancelled`]. The lamp is disconnected on
    /// every exit path.
    pub async fn provision(
        &self,
        device: &DeviceId,
        ctx: &ProvisioningContext,
        cancel: CancellationToken,
    ) -> ProvisioningResult<ProvisionOutcome> {
        self.provision_within(device, ctx, cancel, None).await
    }

    /// [`provision`](Self::provision) with a deadline; expiry counts as cancellation.
    ///
    /// The timeout starts once the call gets the gate.
    pub async fn provision_with_timeout(
        &self,
        device: &DeviceId,
        ctx: &ProvisioningContext,
        timeout: Duration,
    ) -> ProvisioningResult<ProvisionOutcome> {
        self.provision_within(device, ctx, CancellationToken::new(), Some(timeout))
            .await
    }

    async fn provision_within(
        &self,
        device: &DeviceId,
        ctx: &ProvisioningContext,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> ProvisioningResult<ProvisionOutcome> {
        let scope = self.scope(cancel).await;
        let Some(mut session) = scope.run(self.gate.lock()).await else {
            debug!("Provisioning of {} cancelled while waiting for the gate", device);
            return Ok(ProvisionOutcome::Cancelled);
        };
        let (scope, _deadline) = scope.limited(timeout);

        self.teardown(&mut session).await;
        let id = session.begin(scope.clone());
        info!("[{}] Provisioning {} (SSID {:?})", id, device, ctx.ssid());

        let result = self.run_provision(&mut session, &scope, device, ctx).await;
        self.teardown(&mut session).await;

        match result {
            Ok(()) => {
                info!("[{}] {} accepted the credentials", id, device);
                Ok(ProvisionOutcome::Provisioned)
            }
            Err(Abort::Cancelled) => {
                info!("[{}] Provisioning cancelled", id);
                Ok(ProvisionOutcome::Cancelled)
            }
            Err(Abort::Failed(e)) => {
                warn!("[{}] Provisioning failed: {}", id, e);
                Err(e)
            }
        }
    }

    async fn run_provision(
        &self,
        session: &mut Session,
        scope: &CancelScope,
        device: &DeviceId,
        ctx: &ProvisioningContext,
    ) -> Result<(), Abort> {
        let frame = encode_context(ctx)?;

        session.set_device(device.clone());
        // Observe the link before it exists so a drop right after connect is not missed
        let mut disconnects = step(scope, self.backend.watch_disconnect(device)).await?;
        debug!("Connecting to {}", device);
        guarded(scope, &mut disconnects, self.backend.connect(device)).await?;

        let services = guarded(scope, &mut disconnects, self.backend.services(device)).await?;
        let service = services
            .iter()
            .find(|s| s.uuid == PROVISIONING_SERVICE_UUID)
            .ok_or(ProtocolError::ServiceNotFound(PROVISIONING_SERVICE_UUID))?;
        let credentials = service
            .characteristic(CREDENTIALS_CHAR_UUID)
            .cloned()
            .ok_or(ProtocolError::CharacteristicNotFound(CREDENTIALS_CHAR_UUID))?;
        let result = service
            .characteristic(RESULT_CHAR_UUID)
            .cloned()
            .ok_or(ProtocolError::CharacteristicNotFound(RESULT_CHAR_UUID))?;
        session.set_characteristics(credentials.clone(), result.clone());

        // Notifications must be live before the write or a fast answer is lost
        session.set_subscribed();
        let mut notifications =
            guarded(scope, &mut disconnects, self.backend.subscribe(&result)).await?;

        debug!("Writing {} byte credential frame", frame.len());
        guarded(
            scope,
            &mut disconnects,
            self.backend.write(&credentials, &frame),
        )
        .await?;

        let payload = await_result(scope, &mut disconnects, &mut notifications).await?;
        drop(notifications);
        debug!("Result notification: {}", hex::encode(&payload));

        match parse_result(&payload)? {
            ResultStatus::Accepted => Ok(()),
            ResultStatus::Rejected(code) => Err(ProvisioningError::Rejected { code }.into()),
        }
    }

    /// Release whatever the session still holds. Failures are logged, never returned.
    async fn teardown(&self, session: &mut Session) {
        if session.is_empty() {
            return;
        }

        if session.is_scanning() {
            if let Err(e) = self.backend.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        if let Some(handle) = session.subscription() {
            if let Err(e) = self.backend.unsubscribe(handle).await {
                warn!("Failed to unsubscribe from {}: {}", handle.uuid, e);
            }
        }
        if let Some(device) = session.device() {
            if let Err(e) = self.backend.disconnect(device).await {
                warn!("Failed to disconnect {}: {}", device, e);
            }
        }

        if let Some(id) = session.id() {
            debug!(
                "[{}] Session torn down (cancelled: {})",
                id,
                session.is_cancelled()
            );
        }
        session.clear();
    }

    /// Cancel the running and queued calls, then release every BLE resource.
    ///
    /// Returns once the gate is free. Safe to call when idle or concurrently.
    pub async fn cancel_and_reset(&self) {
        if self.resetting.swap(true, Ordering::AcqRel) {
            debug!("Reset already in progress");
            drop(self.gate.lock().await);
            return;
        }
        let _guard = ResetGuard(&self.resetting);

        {
            let mut epoch = self.epoch.write().await;
            epoch.cancel();
            *epoch = CancellationToken::new();
        }

        let mut session = self.gate.lock().await;
        self.teardown(&mut session).await;
        debug!("Client reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBleBackend, MockCall};
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    const LAMP: &str = "AA:BB:CC:DD:EE:01";
    const PREFIX: &str = "LinkedLamp_Caskev_";

    fn client(backend: &Arc<MockBleBackend>) -> ProvisioningClient<MockBleBackend> {
        ProvisioningClient::new(backend.clone())
    }

    fn home() -> ProvisioningContext {
        ProvisioningContext::new("home", "MyWifi", "secret123").unwrap()
    }

    fn lamp() -> DeviceId {
        DeviceId::new(LAMP)
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        token
    }

    #[tokio::test]
    async fn test_scan_filters_by_name_prefix() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60)).await;
        backend
            .add_device("AA:BB:CC:DD:EE:02", Some("OtherDevice"), Some(-40))
            .await;

        let devices = client(&backend)
            .scan_for(Some(PREFIX), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, lamp());
        assert_eq!(devices[0].name.as_deref(), Some("LinkedLamp_Caskev_01"));
    }

    #[tokio::test]
    async fn test_scan_keeps_latest_advertisement_and_skips_unnamed() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-80)).await;
        backend.add_device("AA:BB:CC:DD:EE:03", None, Some(-30)).await;
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-50)).await;

        let devices = client(&backend)
            .scan_for(None, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].rssi, Some(-50));
    }

    #[tokio::test]
    async fn test_scan_sorts_by_signal_strength() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device("AA:BB:CC:DD:EE:01", Some("LinkedLamp_Caskev_01"), Some(-70)).await;
        backend.add_device("AA:BB:CC:DD:EE:02", Some("LinkedLamp_Caskev_02"), None).await;
        backend.add_device("AA:BB:CC:DD:EE:03", Some("LinkedLamp_Caskev_03"), Some(-40)).await;

        let devices = client(&backend)
            .scan_for(Some(PREFIX), Duration::from_millis(100))
            .await
            .unwrap();

        let rssi: Vec<_> = devices.iter().map(|d| d.rssi).collect();
        assert_eq!(rssi, vec![Some(-40), Some(-70), None]);
    }

    #[tokio::test]
    async fn test_scan_ignores_devices_without_service() {
        let backend = Arc::new(MockBleBackend::new());
        backend
            .add_advertisement(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60), vec![])
            .await;

        let devices = client(&backend)
            .scan_for(Some(PREFIX), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(devices.is_empty());
        assert_eq!(
            backend.calls().await.first(),
            Some(&MockCall::StartScan(PROVISIONING_SERVICE_UUID))
        );
    }

    #[tokio::test]
    async fn test_scan_returns_devices_found_before_cancellation() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60)).await;
        backend
            .add_device("AA:BB:CC:DD:EE:02", Some("LinkedLamp_Caskev_02"), Some(-65))
            .await;
        backend.set_discovery_interval(Duration::from_millis(200)).await;

        let devices = client(&backend)
            .scan(Some(PREFIX), cancel_after(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, lamp());
        assert!(!backend.is_scanning().await);
        assert_eq!(backend.open_observers().await, 0);
    }

    #[tokio::test]
    async fn test_scan_first_stops_at_first_match() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device("AA:BB:CC:DD:EE:02", Some("OtherDevice"), Some(-40)).await;
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60)).await;
        backend
            .add_device("AA:BB:CC:DD:EE:03", Some("LinkedLamp_Caskev_03"), Some(-30))
            .await;

        let device = client(&backend)
            .scan_first(Some(PREFIX), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(device.map(|d| d.id), Some(lamp()));
        assert!(!backend.is_scanning().await);
        assert_eq!(backend.calls().await.last(), Some(&MockCall::StopScan));
    }

    #[tokio::test]
    async fn test_scan_first_cancelled_without_match() {
        let backend = Arc::new(MockBleBackend::new());

        let device = client(&backend)
            .scan_first(Some(PREFIX), cancel_after(Duration::from_millis(30)))
            .await
            .unwrap();

        assert!(device.is_none());
        assert!(!backend.is_scanning().await);
    }

    #[tokio::test]
    async fn test_scan_failure_is_transport_error() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_scan_failure(true).await;

        let result = client(&backend)
            .scan_for(Some(PREFIX), Duration::from_millis(50))
            .await;

        assert!(matches!(
            result,
            Err(ProvisioningError::Transport(BackendError::ScanFailed(_)))
        ));
        assert!(!backend.is_scanning().await);
        assert_eq!(backend.max_active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_provision_writes_frame_and_succeeds() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;

        let outcome = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert_eq!(assert_ok!(outcome), ProvisionOutcome::Provisioned);
        assert_eq!(
            backend.writes_to(CREDENTIALS_CHAR_UUID).await,
            vec![vec![
                0x04, 0x68, 0x6F, 0x6D, 0x65, 0x06, 0x4D, 0x79, 0x57, 0x69, 0x66, 0x69, 0x09,
                0x73, 0x65, 0x63, 0x72, 0x65, 0x74, 0x31, 0x32, 0x33,
            ]]
        );
        assert_eq!(backend.disconnect_calls().await, 1);
        assert!(!backend.is_connected(&lamp()).await);
        assert_eq!(backend.open_observers().await, 0);
    }

    #[tokio::test]
    async fn test_provision_subscribes_before_write() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;

        client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await
            .unwrap();

        let calls = backend.calls().await;
        let subscribe = calls
            .iter()
            .position(|c| *c == MockCall::Subscribe(RESULT_CHAR_UUID))
            .unwrap();
        let write = calls
            .iter()
            .position(|c| matches!(c, MockCall::Write(uuid, _) if *uuid == CREDENTIALS_CHAR_UUID))
            .unwrap();
        assert!(subscribe < write);
        assert_eq!(
            &calls[..2],
            &[MockCall::WatchDisconnect(lamp()), MockCall::Connect(lamp())]
        );
    }

    #[tokio::test]
    async fn test_teardown_unsubscribes_before_disconnect() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;

        client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await
            .unwrap();

        let calls = backend.calls().await;
        assert_eq!(
            &calls[calls.len() - 2..],
            &[
                MockCall::Unsubscribe(RESULT_CHAR_UUID),
                MockCall::Disconnect(lamp())
            ]
        );
    }

    #[tokio::test]
    async fn test_immediate_answer_is_not_lost() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;
        backend.set_response_delay(Duration::ZERO).await;

        let outcome = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProvisionOutcome::Provisioned);
        let received = backend.received_credentials().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].group_name, "home");
        assert_eq!(received[0].ssid, "MyWifi");
        assert_eq!(received[0].password, "secret123");
    }

    #[tokio::test]
    async fn test_link_drop_right_after_connect() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;
        backend.set_drop_link_on_connect(true).await;

        let client = client(&backend);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.provision(&lamp(), &home(), CancellationToken::new()),
        )
        .await
        .expect("provisioning hung after link drop");

        assert!(matches!(result, Err(ProvisioningError::Disconnected)));
        assert!(backend.writes_to(CREDENTIALS_CHAR_UUID).await.is_empty());
        assert_eq!(backend.disconnect_calls().await, 1);
    }

    #[tokio::test]
    async fn test_teardown_failures_keep_success() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;
        backend.set_unsubscribe_failure(true).await;
        backend.set_disconnect_failure(true).await;

        let outcome = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert_eq!(assert_ok!(outcome), ProvisionOutcome::Provisioned);
        let calls = backend.calls().await;
        assert!(calls.contains(&MockCall::Unsubscribe(RESULT_CHAR_UUID)));
        assert!(calls.contains(&MockCall::Disconnect(lamp())));
    }

    #[tokio::test]
    async fn test_teardown_failures_keep_rejection() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![0])).await;
        backend.set_unsubscribe_failure(true).await;
        backend.set_disconnect_failure(true).await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProvisioningError::Rejected { code: 0 })));
    }

    #[tokio::test]
    async fn test_provision_cancelled_while_waiting_for_result() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;

        let outcome = client(&backend)
            .provision(&lamp(), &home(), cancel_after(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(backend.disconnect_calls().await, 1);
        assert!(!backend.is_connected(&lamp()).await);
        assert_eq!(backend.open_observers().await, 0);
    }

    #[tokio::test]
    async fn test_provision_reports_disconnect_instead_of_hanging() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;
        backend
            .set_disconnect_after_write(Some(Duration::from_millis(50)))
            .await;

        let client = client(&backend);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.provision(&lamp(), &home(), CancellationToken::new()),
        )
        .await
        .expect("provisioning hung after disconnect");

        assert!(matches!(result, Err(ProvisioningError::Disconnected)));
        assert_eq!(backend.open_observers().await, 0);
    }

    #[tokio::test]
    async fn test_provision_rejected() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![0])).await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        let err = assert_err!(result);
        assert!(matches!(err, ProvisioningError::Rejected { code: 0 }));
        assert!(err.is_credentials_problem());
        assert_eq!(backend.disconnect_calls().await, 1);
    }

    #[tokio::test]
    async fn test_provision_empty_result_is_malformed() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![])).await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ProvisioningError::Protocol(ProtocolError::MalformedResponse))
        ));
    }

    #[tokio::test]
    async fn test_provision_without_service() {
        let backend = Arc::new(MockBleBackend::new());
        let gap = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
        backend.set_gatt_layout(vec![(gap, vec![])]).await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ProvisioningError::Protocol(ProtocolError::ServiceNotFound(uuid)))
                if uuid == PROVISIONING_SERVICE_UUID
        ));
        assert_eq!(backend.disconnect_calls().await, 1);
        assert!(backend.writes_to(CREDENTIALS_CHAR_UUID).await.is_empty());
    }

    #[tokio::test]
    async fn test_provision_without_result_characteristic() {
        let backend = Arc::new(MockBleBackend::new());
        backend
            .set_gatt_layout(vec![(PROVISIONING_SERVICE_UUID, vec![CREDENTIALS_CHAR_UUID])])
            .await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ProvisioningError::Protocol(ProtocolError::CharacteristicNotFound(uuid)))
                if uuid == RESULT_CHAR_UUID
        ));
    }

    #[tokio::test]
    async fn test_provision_connect_failure() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_connect_failure(true).await;

        let result = client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(ProvisioningError::Transport(BackendError::ConnectionFailed(_)))
        ));
        assert!(!result.unwrap_err().is_credentials_problem());
        assert!(backend.writes_to(CREDENTIALS_CHAR_UUID).await.is_empty());
    }

    #[tokio::test]
    async fn test_result_observer_unregistered_after_outcome() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;

        client(&backend)
            .provision(&lamp(), &home(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.notify(&lamp(), RESULT_CHAR_UUID, vec![0]).await, 0);
    }

    #[tokio::test]
    async fn test_provision_with_timeout_is_cancellation() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;

        let outcome = client(&backend)
            .provision_with_timeout(&lamp(), &home(), Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(outcome, ProvisionOutcome::Cancelled);
        assert_eq!(backend.disconnect_calls().await, 1);
    }

    #[tokio::test]
    async fn test_reset_when_idle_is_noop() {
        let backend = Arc::new(MockBleBackend::new());
        let client = client(&backend);

        client.cancel_and_reset().await;
        client.cancel_and_reset().await;

        assert!(backend.calls().await.is_empty());
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn test_reset_cancels_running_provision() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;
        let client = Arc::new(client(&backend));

        let task = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_busy());
        client.cancel_and_reset().await;

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, ProvisionOutcome::Cancelled);
        assert_eq!(backend.disconnect_calls().await, 1);
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn test_reset_cancels_queued_call() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;
        let client = Arc::new(client(&backend));

        let spawn_provision = |client: Arc<ProvisioningClient<MockBleBackend>>| {
            tokio::spawn(async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            })
        };

        let running = spawn_provision(client.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = spawn_provision(client.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.cancel_and_reset().await;

        assert!(running.await.unwrap().unwrap().is_cancelled());
        assert!(queued.await.unwrap().unwrap().is_cancelled());
        let connects = backend
            .calls()
            .await
            .iter()
            .filter(|call| matches!(call, MockCall::Connect(_)))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(backend.disconnect_calls().await, 1);
    }

    #[tokio::test]
    async fn test_scan_window_starts_after_gate() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60)).await;
        backend.set_response(Some(vec![1])).await;
        backend.set_response_delay(Duration::from_millis(150)).await;
        let client = Arc::new(client(&backend));

        let provision = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let devices = client
            .scan_for(Some(PREFIX), Duration::from_millis(80))
            .await
            .unwrap();

        assert_eq!(provision.await.unwrap().unwrap(), ProvisionOutcome::Provisioned);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, lamp());
    }

    #[tokio::test]
    async fn test_concurrent_resets_complete() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;
        let client = Arc::new(client(&backend));

        let task = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::join!(client.cancel_and_reset(), client.cancel_and_reset());

        assert!(task.await.unwrap().unwrap().is_cancelled());
        assert_eq!(backend.disconnect_calls().await, 1);
        assert!(!backend.is_connected(&lamp()).await);
    }

    #[tokio::test]
    async fn test_provision_after_reset() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(Some(vec![1])).await;
        let client = client(&backend);

        client.cancel_and_reset().await;
        let outcome = client
            .provision(&lamp(), &home(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProvisionOutcome::Provisioned);
    }

    #[tokio::test]
    async fn test_reset_cleans_up_after_dropped_call() {
        let backend = Arc::new(MockBleBackend::new());
        backend.set_response(None).await;
        let client = client(&backend);

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            client.provision(&lamp(), &home(), CancellationToken::new()),
        )
        .await;
        assert!(dropped.is_err());
        assert!(backend.is_connected(&lamp()).await);

        client.cancel_and_reset().await;

        assert!(!backend.is_connected(&lamp()).await);
        assert_eq!(backend.disconnect_calls().await, 1);
        assert_eq!(backend.open_observers().await, 0);
    }

    #[tokio::test]
    async fn test_calls_are_single_flight() {
        let backend = Arc::new(MockBleBackend::new());
        backend.add_device(LAMP, Some("LinkedLamp_Caskev_01"), Some(-60)).await;
        backend.set_response(Some(vec![1])).await;
        backend.set_connect_delay(Duration::from_millis(20)).await;
        let client = Arc::new(client(&backend));

        let provision = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            }
        });
        let scan = tokio::spawn({
            let client = client.clone();
            async move { client.scan_for(Some(PREFIX), Duration::from_millis(200)).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .provision(&lamp(), &home(), CancellationToken::new())
                    .await
            }
        });

        assert_eq!(provision.await.unwrap().unwrap(), ProvisionOutcome::Provisioned);
        assert!(scan.await.unwrap().is_ok());
        assert_eq!(second.await.unwrap().unwrap(), ProvisionOutcome::Provisioned);
        assert_eq!(backend.max_active_sessions().await, 1);
    }
}
