//! Open device handles
//!
//! The handle manager owns every open handle of a context and the state the
//! transfer engine validates against. Claimed interfaces with their selected
//! alternate settings, and whether the handle is closing, are per handle.
//! The active configuration belongs to the device, so every handle open on
//! one attachment shares it.
//!
//! Lock order: handle table, then a handle's state lock, then the device's
//! configuration lock, then the claim table. The table lock is never held
//! across backend calls.

use crate::backend::{BackendError, BackendHandleId, BackendResult, HostBackend};
use crate::device::{Device, DeviceKey};
use crate::error::{Result, UsbError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

/// Identifier of an open handle, unique within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Device-wide state shared by the handles open on one attachment
struct DeviceSession {
    device: Device,
    active_configuration: Mutex<Option<u8>>,
}

impl DeviceSession {
    fn configuration(&self) -> MutexGuard<'_, Option<u8>> {
        self.active_configuration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Default)]
pub(crate) struct HandleState {
    /// Claimed interface number to selected alternate setting
    pub(crate) claimed: BTreeMap<u8, u8>,
    /// Interfaces whose kernel driver this handle detached
    detached: BTreeSet<u8>,
    pub(crate) closed: bool,
}

impl HandleState {
    pub(crate) fn selected_alt(&self, interface: u8) -> u8 {
        self.claimed.get(&interface).copied().unwrap_or(0)
    }
}

pub(crate) struct HandleEntry {
    pub(crate) id: HandleId,
    pub(crate) device: Device,
    pub(crate) backend_handle: BackendHandleId,
    session: Arc<DeviceSession>,
    state: RwLock<HandleState>,
}

impl HandleEntry {
    /// Configuration currently selected on the device
    pub(crate) fn active_configuration(&self) -> Option<u8> {
        *self.session.configuration()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HandleState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HandleState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Convert a backend failure, noting a vanished device
    pub(crate) fn backend_error(&self, error: BackendError) -> UsbError {
        if error == BackendError::NoDevice {
            self.device.mark_gone();
        }
        error.into()
    }

    pub(crate) fn check<T>(&self, result: BackendResult<T>) -> Result<T> {
        result.map_err(|e| self.backend_error(e))
    }
}

/// Handle state readable and writable only while the handle is open
fn ensure_open(entry: &HandleEntry, state: &HandleState) -> Result<()> {
    if state.closed {
        return Err(UsbError::InvalidHandle);
    }
    entry.device.ensure_present()
}

pub(crate) struct HandleManager {
    backend: Arc<dyn HostBackend>,
    handles: Mutex<HashMap<HandleId, Arc<HandleEntry>>>,
    claims: Mutex<HashMap<(DeviceKey, u8), HandleId>>,
    sessions: Mutex<HashMap<DeviceKey, Weak<DeviceSession>>>,
    next_id: AtomicU64,
    max_open_handles: usize,
    auto_detach_kernel_driver: bool,
}

impl HandleManager {
    pub(crate) fn new(
        backend: Arc<dyn HostBackend>,
        max_open_handles: usize,
        auto_detach_kernel_driver: bool,
    ) -> Self {
        Self {
            backend,
            handles: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_open_handles,
            auto_detach_kernel_driver,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<HandleId, Arc<HandleEntry>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<(DeviceKey, u8), HandleId>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn open(&self, device: &Device) -> Result<Arc<HandleEntry>> {
        device.ensure_present()?;
        if self.table().len() >= self.max_open_handles {
            return Err(UsbError::TooManyOpenHandles);
        }

        let backend_handle = self.backend.open(device.backend_id()).map_err(|e| match e {
            BackendError::NoDevice | BackendError::NotFound => {
                device.mark_gone();
                UsbError::DeviceGone
            }
            BackendError::NoMem => UsbError::TooManyOpenHandles,
            other => other.into(),
        })?;

        let session = self.session(device, backend_handle);
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(HandleEntry {
            id,
            device: device.clone(),
            backend_handle,
            session,
            state: RwLock::new(HandleState::default()),
        });

        let mut table = self.table();
        if table.len() >= self.max_open_handles {
            drop(table);
            self.backend.close(backend_handle);
            return Err(UsbError::TooManyOpenHandles);
        }
        table.insert(id, entry.clone());
        drop(table);

        info!("Opened {} for device {}", id, device);
        Ok(entry)
    }

    /// State of the attachment `device` belongs to, shared with any handle
    /// already open on it. A fresh session reads the active configuration
    /// through `backend_handle`.
    fn session(&self, device: &Device, backend_handle: BackendHandleId) -> Arc<DeviceSession> {
        let existing = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device.key())
            .and_then(Weak::upgrade)
            .filter(|s| s.device.same_attachment(device));
        if let Some(session) = existing {
            return session;
        }

        let active_configuration = match self.backend.active_configuration(backend_handle) {
            Ok(0) => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to read active configuration of {}: {}", device, e);
                None
            }
        };
        let session = Arc::new(DeviceSession {
            device: device.clone(),
            active_configuration: Mutex::new(active_configuration),
        });

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions
            .get(device.key())
            .and_then(Weak::upgrade)
            .filter(|s| s.device.same_attachment(device))
        {
            // Another open of the same attachment got there first
            Some(current) => current,
            None => {
                sessions.retain(|_, s| s.strong_count() > 0);
                sessions.insert(device.key().clone(), Arc::downgrade(&session));
                session
            }
        }
    }

    pub(crate) fn get(&self, id: HandleId) -> Result<Arc<HandleEntry>> {
        self.table().get(&id).cloned().ok_or(UsbError::InvalidHandle)
    }

    pub(crate) fn open_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.table().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn open_count(&self) -> usize {
        self.table().len()
    }

    /// First half of closing: no new work is accepted on the handle after
    /// this. A second close fails with `InvalidHandle`.
    pub(crate) fn begin_close(&self, id: HandleId) -> Result<Arc<HandleEntry>> {
        let entry = self.get(id)?;
        let mut state = entry.write();
        if state.closed {
            return Err(UsbError::InvalidHandle);
        }
        state.closed = true;
        drop(state);
        Ok(entry)
    }

    /// Second half of closing, once pending transfers have settled: release
    /// interfaces, reattach kernel drivers and close the native handle
    pub(crate) fn finish_close(&self, entry: &HandleEntry) {
        let mut state = entry.write();
        let interfaces: Vec<u8> = state.claimed.keys().copied().collect();
        for interface in interfaces {
            if let Err(e) = self.release_locked(entry, &mut state, interface) {
                debug!("Release of interface {} on close failed: {}", interface, e);
            }
        }
        drop(state);

        self.backend.close(entry.backend_handle);
        self.table().remove(&entry.id);
        info!("Closed {}", entry.id);
    }

    pub(crate) fn active_configuration(&self, id: HandleId) -> Result<Option<u8>> {
        let entry = self.get(id)?;
        let state = entry.read();
        if state.closed {
            return Err(UsbError::InvalidHandle);
        }
        Ok(entry.active_configuration())
    }

    pub(crate) fn claimed_interfaces(&self, id: HandleId) -> Result<Vec<u8>> {
        let entry = self.get(id)?;
        let state = entry.read();
        if state.closed {
            return Err(UsbError::InvalidHandle);
        }
        Ok(state.claimed.keys().copied().collect())
    }

    /// Select configuration `value`, 0 to unconfigure. Every handle open on
    /// the device sees the change.
    pub(crate) fn set_configuration(&self, id: HandleId, value: u8) -> Result<()> {
        let entry = self.get(id)?;
        let state = entry.write();
        ensure_open(&entry, &state)?;
        let mut active = entry.session.configuration();

        let mut claimed: Vec<u8> = self
            .claims()
            .keys()
            .filter(|(key, _)| key == entry.device.key())
            .map(|(_, interface)| *interface)
            .collect();
        if !claimed.is_empty() {
            claimed.sort_unstable();
            return Err(UsbError::InterfacesStillClaimed(claimed));
        }

        if value != 0 && entry.device.configuration(value).is_none() {
            return Err(UsbError::InvalidParam(format!(
                "device has no configuration {}",
                value
            )));
        }

        entry.check(self.backend.set_configuration(entry.backend_handle, value))?;
        *active = (value != 0).then_some(value);
        debug!("{} set configuration {}", id, value);
        Ok(())
    }

    pub(crate) fn claim_interface(&self, id: HandleId, interface: u8) -> Result<()> {
        let entry = self.get(id)?;
        let mut state = entry.write();
        ensure_open(&entry, &state)?;

        if state.claimed.contains_key(&interface) {
            return Ok(());
        }

        // Held until the claim is recorded so the configuration cannot
        // change underneath it
        let active = entry.session.configuration();
        let value = (*active)
            .ok_or_else(|| UsbError::InvalidParam("device is not configured".to_string()))?;
        let has_interface = entry
            .device
            .configuration(value)
            .is_some_and(|c| c.interface(interface).is_some());
        if !has_interface {
            return Err(UsbError::InvalidParam(format!(
                "configuration {} has no interface {}",
                value, interface
            )));
        }

        let key = (entry.device.key().clone(), interface);
        {
            let mut claims = self.claims();
            if claims.get(&key).is_some_and(|owner| *owner != id) {
                return Err(UsbError::InterfaceBusy(interface));
            }
            claims.insert(key.clone(), id);
        }

        if let Err(e) = self.claim_native(&entry, &mut state, interface) {
            self.claims().remove(&key);
            return Err(e);
        }

        state.claimed.insert(interface, 0);
        debug!("{} claimed interface {}", id, interface);
        Ok(())
    }

    fn claim_native(&self, entry: &HandleEntry, state: &mut HandleState, interface: u8) -> Result<()> {
        let handle = entry.backend_handle;

        if self.auto_detach_kernel_driver {
            match self.backend.kernel_driver_active(handle, interface) {
                Ok(true) => {
                    entry.check(self.backend.detach_kernel_driver(handle, interface))?;
                    state.detached.insert(interface);
                    debug!("Detached kernel driver from interface {}", interface);
                }
                Ok(false) | Err(BackendError::NotSupported) => {}
                Err(e) => debug!("Kernel driver query for interface {} failed: {}", interface, e),
            }
        }

        let result = self.backend.claim_interface(handle, interface);
        if result.is_err() && state.detached.remove(&interface) {
            if let Err(e) = self.backend.attach_kernel_driver(handle, interface) {
                warn!("Failed to reattach kernel driver to interface {}: {}", interface, e);
            }
        }

        match result {
            Err(BackendError::Busy) => Err(UsbError::InterfaceBusy(interface)),
            other => entry.check(other),
        }
    }

    pub(crate) fn release_interface(&self, id: HandleId, interface: u8) -> Result<()> {
        let entry = self.get(id)?;
        let mut state = entry.write();
        if state.closed {
            return Err(UsbError::InvalidHandle);
        }
        if !state.claimed.contains_key(&interface) {
            entry.device.ensure_present()?;
            return Err(UsbError::InvalidParam(format!(
                "interface {} is not claimed",
                interface
            )));
        }
        self.release_locked(&entry, &mut state, interface)
    }

    /// Drop the claim locally first; the native release only reports. A
    /// gone device gets no native call and the release fails with
    /// `DeviceGone` once the claim is dropped.
    fn release_locked(&self, entry: &HandleEntry, state: &mut HandleState, interface: u8) -> Result<()> {
        state.claimed.remove(&interface);
        self.claims().remove(&(entry.device.key().clone(), interface));

        if entry.device.is_gone() {
            state.detached.remove(&interface);
            debug!("{} dropped interface {} of a gone device", entry.id, interface);
            return Err(UsbError::DeviceGone);
        }

        let handle = entry.backend_handle;
        let result = match self.backend.release_interface(handle, interface) {
            Err(BackendError::NoDevice) => {
                entry.device.mark_gone();
                Ok(())
            }
            other => entry.check(other),
        };

        if state.detached.remove(&interface) && !entry.device.is_gone() {
            match self.backend.attach_kernel_driver(handle, interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => warn!("Failed to reattach kernel driver to interface {}: {}", interface, e),
            }
        }

        debug!("{} released interface {}", entry.id, interface);
        result
    }

    pub(crate) fn set_alternate_setting(&self, id: HandleId, interface: u8, alternate_setting: u8) -> Result<()> {
        let entry = self.get(id)?;
        let mut state = entry.write();
        ensure_open(&entry, &state)?;

        if !state.claimed.contains_key(&interface) {
            return Err(UsbError::InvalidParam(format!(
                "interface {} is not claimed",
                interface
            )));
        }

        let exists = entry
            .active_configuration()
            .and_then(|value| entry.device.configuration(value))
            .and_then(|config| config.interface(interface))
            .is_some_and(|i| i.alt_setting(alternate_setting).is_some());
        if !exists {
            return Err(UsbError::InvalidParam(format!(
                "interface {} has no alternate setting {}",
                interface, alternate_setting
            )));
        }

        entry.check(self.backend.set_alternate_setting(
            entry.backend_handle,
            interface,
            alternate_setting,
        ))?;
        state.claimed.insert(interface, alternate_setting);
        Ok(())
    }

    pub(crate) fn clear_halt(&self, id: HandleId, endpoint: u8) -> Result<()> {
        let entry = self.get(id)?;
        let state = entry.read();
        ensure_open(&entry, &state)?;
        entry.check(self.backend.clear_halt(entry.backend_handle, endpoint))
    }

    /// Port reset; claimed interfaces fall back to alternate setting 0
    pub(crate) fn reset_device(&self, id: HandleId) -> Result<()> {
        let entry = self.get(id)?;
        let mut state = entry.write();
        ensure_open(&entry, &state)?;

        match self.backend.reset_device(entry.backend_handle) {
            Ok(()) => {
                for alt in state.claimed.values_mut() {
                    *alt = 0;
                }
                Ok(())
            }
            // The device re-enumerated with different descriptors
            Err(BackendError::NotFound) => {
                entry.device.mark_gone();
                Err(UsbError::DeviceGone)
            }
            Err(e) => Err(entry.backend_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockDevice};
    use crate::registry::Registry;
    use common::test_utils::{create_bulk_config_descriptor, create_mock_device_descriptor};

    fn setup(max_open: usize) -> (Arc<MockBackend>, HandleManager, Device) {
        let mock = Arc::new(MockBackend::new());
        mock.add_device(MockDevice::new(
            1,
            vec![1],
            2,
            create_mock_device_descriptor(0x1234, 0x5678),
            vec![create_bulk_config_descriptor(1)],
        ));
        let device = Registry::new(mock.clone(), Vec::new())
            .enumerate()
            .unwrap()
            .into_devices()
            .remove(0);
        let manager = HandleManager::new(mock.clone(), max_open, true);
        (mock, manager, device)
    }

    #[test]
    fn test_open_limit() {
        let (_, manager, device) = setup(1);
        manager.open(&device).unwrap();
        assert!(matches!(
            manager.open(&device),
            Err(UsbError::TooManyOpenHandles)
        ));
    }

    #[test]
    fn test_claim_requires_configuration() {
        let (_, manager, device) = setup(4);
        let entry = manager.open(&device).unwrap();
        assert!(matches!(
            manager.claim_interface(entry.id, 0),
            Err(UsbError::InvalidParam(_))
        ));

        manager.set_configuration(entry.id, 1).unwrap();
        manager.claim_interface(entry.id, 0).unwrap();
        assert_eq!(manager.claimed_interfaces(entry.id).unwrap(), vec![0]);
    }

    #[test]
    fn test_set_configuration_with_claims_fails() {
        let (_, manager, device) = setup(4);
        let entry = manager.open(&device).unwrap();
        manager.set_configuration(entry.id, 1).unwrap();
        manager.claim_interface(entry.id, 0).unwrap();

        assert_eq!(
            manager.set_configuration(entry.id, 1),
            Err(UsbError::InterfacesStillClaimed(vec![0]))
        );

        manager.release_interface(entry.id, 0).unwrap();
        assert!(manager.set_configuration(entry.id, 1).is_ok());
    }

    #[test]
    fn test_release_unclaimed_fails() {
        let (_, manager, device) = setup(4);
        let entry = manager.open(&device).unwrap();
        assert!(matches!(
            manager.release_interface(entry.id, 0),
            Err(UsbError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_close_twice_is_invalid() {
        let (mock, manager, device) = setup(4);
        let entry = manager.open(&device).unwrap();
        let entry = manager.begin_close(entry.id).unwrap();
        manager.finish_close(&entry);
        assert_eq!(mock.open_handle_count(), 0);
        assert!(matches!(
            manager.begin_close(entry.id),
            Err(UsbError::InvalidHandle)
        ));
    }
}
