//! Provisioning session state
//!
//! Lives inside the client's gate mutex, so it is only reachable by the call
//! currently holding the gate.

use crate::core::{
    cancel::CancelScope,
    types::{CharacteristicHandle, DeviceId, SessionId},
};

/// Resources held by the running scan or provisioning call
#[derive(Debug, Default)]
pub struct Session {
    id: Option<SessionId>,
    scope: Option<CancelScope>,
    scanning: bool,
    device: Option<DeviceId>,
    credentials_char: Option<CharacteristicHandle>,
    result_char: Option<CharacteristicHandle>,
    subscribed: bool,
}

impl Session {
    /// Start a new logical session owned by `scope`
    pub fn begin(&mut self, scope: CancelScope) -> SessionId {
        let id = SessionId::new();
        self.id = Some(id);
        self.scope = Some(scope);
        id
    }

    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    /// True once every resource has been released
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.scope.is_none()
            && !self.scanning
            && self.device.is_none()
            && self.credentials_char.is_none()
            && self.result_char.is_none()
            && !self.subscribed
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.as_ref().is_some_and(CancelScope::is_cancelled)
    }

    pub fn set_scanning(&mut self) {
        self.scanning = true;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record the peripheral before connecting so a reset can always disconnect it
    pub fn set_device(&mut self, device: DeviceId) {
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub fn set_characteristics(
        &mut self,
        credentials: CharacteristicHandle,
        result: CharacteristicHandle,
    ) {
        self.credentials_char = Some(credentials);
        self.result_char = Some(result);
    }

    pub fn set_subscribed(&mut self) {
        self.subscribed = true;
    }

    /// Forget every resource; call once they have been released
    pub fn clear(&mut self) {
        *self = Session::default();
    }

    /// Result characteristic, if notifications on it are enabled
    pub fn subscription(&self) -> Option<&CharacteristicHandle> {
        self.result_char.as_ref().filter(|_| self.subscribed)
    }
}
