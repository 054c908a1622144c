//! In-memory host controller
//!
//! Simulates a bus of devices built from raw descriptor bytes. Transfers are
//! answered from per-endpoint scripts, optionally after a delay, or held
//! until a test completes them by hand. Every backend call is recorded so
//! tests can assert that an operation caused no I/O.
//!
//! Without a script, OUT transfers are accepted in full, string descriptor
//! requests are answered from the device's string table, and other IN
//! transfers are held (a device with nothing to send NAKs forever).

use super::{
    BackendCompletion, BackendDeviceId, BackendError, BackendHandleId, BackendIsoPacket,
    BackendResult, BackendStatus, BackendTransfer, CompletionQueue, HostBackend, RawDevice,
};
use crate::device::Speed;
use crate::transfer::{TransferId, TransferKind};
use descriptor::constants::{DT_CONFIG, DT_DEVICE, DT_STRING, REQUEST_GET_DESCRIPTOR};
use descriptor::{Direction, TransferType, encode_language_ids, encode_string_descriptor};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub bus_number: u8,
    pub port_path: Vec<u8>,
    pub address: u8,
    pub speed: Speed,
    pub device_descriptor: Vec<u8>,
    pub config_descriptors: Vec<Vec<u8>>,
    pub languages: Vec<u16>,
    pub strings: HashMap<u8, String>,
    /// Configuration active when the device is first opened, 0 = unconfigured
    pub active_configuration: u8,
    /// Interfaces with a kernel driver bound
    pub kernel_drivers: BTreeSet<u8>,
}

impl MockDevice {
    pub fn new(
        bus_number: u8,
        port_path: Vec<u8>,
        address: u8,
        device_descriptor: Vec<u8>,
        config_descriptors: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            bus_number,
            port_path,
            address,
            speed: Speed::High,
            device_descriptor,
            config_descriptors,
            languages: vec![descriptor::constants::LANGUAGE_ID_EN_US],
            strings: HashMap::new(),
            active_configuration: 0,
            kernel_drivers: BTreeSet::new(),
        }
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_string(mut self, index: u8, text: &str) -> Self {
        self.strings.insert(index, text.to_string());
        self
    }

    pub fn with_active_configuration(mut self, value: u8) -> Self {
        self.active_configuration = value;
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }

    fn configuration_values(&self) -> Vec<u8> {
        self.config_descriptors
            .iter()
            .filter_map(|c| c.get(5).copied())
            .collect()
    }
}

/// A recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListDevices,
    Open(BackendDeviceId),
    Close(BackendHandleId),
    SetConfiguration { handle: BackendHandleId, value: u8 },
    ClaimInterface { handle: BackendHandleId, interface: u8 },
    ReleaseInterface { handle: BackendHandleId, interface: u8 },
    SetAlternateSetting { handle: BackendHandleId, interface: u8, alternate_setting: u8 },
    ClearHalt { handle: BackendHandleId, endpoint: u8 },
    ResetDevice(BackendHandleId),
    DetachKernelDriver { handle: BackendHandleId, interface: u8 },
    AttachKernelDriver { handle: BackendHandleId, interface: u8 },
    Submit {
        token: TransferId,
        handle: BackendHandleId,
        endpoint: u8,
        transfer_type: TransferType,
        length: usize,
    },
    Cancel(TransferId),
}

/// Operations that accept an injected one-shot error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    SetConfiguration,
    ClaimInterface,
    ReleaseInterface,
    SetAlternateSetting,
    ClearHalt,
    ResetDevice,
    Submit,
}

/// Outcome of one isochronous packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockIsoPacket {
    pub data: Vec<u8>,
    pub error: Option<BackendError>,
}

impl MockIsoPacket {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    pub fn failed(error: BackendError) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }
}

/// How the simulated device answers a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// IN: these bytes are returned. OUT: everything is accepted.
    Data(Vec<u8>),
    /// OUT: only the first `n` bytes are accepted
    Accept(usize),
    Stall,
    Fail(BackendError),
    /// The device disappears
    Disconnect,
    Isochronous(Vec<MockIsoPacket>),
    /// Never completes on its own
    Hold,
}

struct DeviceSlot {
    device: MockDevice,
    present: bool,
    active_configuration: u8,
    kernel_drivers: BTreeSet<u8>,
    claimed: BTreeSet<u8>,
}

struct HandleSlot {
    device: BackendDeviceId,
    claimed: BTreeSet<u8>,
}

#[derive(Default)]
struct MockState {
    devices: Vec<(BackendDeviceId, DeviceSlot)>,
    next_device: u64,
    next_handle: u64,
    handles: HashMap<BackendHandleId, HandleSlot>,
    responses: HashMap<u8, VecDeque<(MockResponse, Duration)>>,
    held: HashMap<TransferId, BackendTransfer>,
    /// Scheduled completions by token, with their handle and endpoint
    scheduled: HashMap<TransferId, (BackendHandleId, u8)>,
    halted: HashSet<(BackendDeviceId, u8)>,
    written: HashMap<u8, Vec<Vec<u8>>>,
    calls: Vec<MockCall>,
    injected: HashMap<MockOp, VecDeque<BackendError>>,
    bus_unavailable: bool,
    reverse_listing: bool,
    completions_paused: bool,
}

impl MockState {
    fn slot(&self, id: BackendDeviceId) -> Option<&DeviceSlot> {
        self.devices.iter().find(|(d, _)| *d == id).map(|(_, s)| s)
    }

    fn slot_mut(&mut self, id: BackendDeviceId) -> Option<&mut DeviceSlot> {
        self.devices.iter_mut().find(|(d, _)| *d == id).map(|(_, s)| s)
    }

    fn present_slot(&self, id: BackendDeviceId) -> BackendResult<&DeviceSlot> {
        match self.slot(id) {
            Some(slot) if slot.present => Ok(slot),
            _ => Err(BackendError::NoDevice),
        }
    }

    /// Device behind an open handle, failing if either is gone
    fn handle_device(&self, handle: BackendHandleId) -> BackendResult<BackendDeviceId> {
        let device = self
            .handles
            .get(&handle)
            .map(|h| h.device)
            .ok_or(BackendError::NotFound)?;
        self.present_slot(device)?;
        Ok(device)
    }

    fn take_injected(&mut self, op: MockOp) -> BackendResult<()> {
        match self.injected.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Simulated host controller
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    queue: CompletionQueue,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug in a device
    pub fn add_device(&self, device: MockDevice) -> BackendDeviceId {
        let mut state = self.lock();
        state.next_device += 1;
        let id = BackendDeviceId(state.next_device);
        let slot = DeviceSlot {
            present: true,
            active_configuration: device.active_configuration,
            kernel_drivers: device.kernel_drivers.clone(),
            claimed: BTreeSet::new(),
            device,
        };
        state.devices.push((id, slot));
        id
    }

    /// Unplug a device; its in-flight transfers fail with `NoDevice`
    pub fn unplug(&self, id: BackendDeviceId) {
        let mut state = self.lock();
        if let Some(slot) = state.slot_mut(id) {
            slot.present = false;
        }

        let handles: HashSet<BackendHandleId> = state
            .handles
            .iter()
            .filter(|(_, h)| h.device == id)
            .map(|(handle, _)| *handle)
            .collect();
        self.fail_transfers_of(&mut state, &handles, |token, buffer| {
            BackendCompletion::new(token, BackendStatus::Failed(BackendError::NoDevice), 0, buffer)
        });
    }

    /// Make `list_devices` fail, as when no host controller is reachable
    pub fn set_bus_unavailable(&self, unavailable: bool) {
        self.lock().bus_unavailable = unavailable;
    }

    /// Keep finished transfers queued instead of handing them to the event
    /// loop, so tests can order other work ahead of their delivery
    pub fn pause_completions(&self, paused: bool) {
        self.lock().completions_paused = paused;
        self.queue.wake();
    }

    /// List devices in reverse plug order
    pub fn set_reverse_listing(&self, reverse: bool) {
        self.lock().reverse_listing = reverse;
    }

    /// Answer the next transfer on `endpoint` with `response`
    pub fn respond(&self, endpoint: u8, response: MockResponse) {
        self.respond_after(endpoint, response, Duration::ZERO);
    }

    /// Answer the next transfer on `endpoint` with `response`, `delay` after
    /// it is submitted
    pub fn respond_after(&self, endpoint: u8, response: MockResponse, delay: Duration) {
        self.lock()
            .responses
            .entry(endpoint)
            .or_default()
            .push_back((response, delay));
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: MockOp, error: BackendError) {
        self.lock().injected.entry(op).or_default().push_back(error);
    }

    /// Complete a held transfer now. Returns false when it is not held.
    pub fn complete(&self, token: TransferId, response: MockResponse) -> bool {
        let mut state = self.lock();
        let Some(transfer) = state.held.remove(&token) else {
            return false;
        };
        match self.resolve(&mut state, transfer, response) {
            Ok(completion) => self.queue.push(completion),
            Err(transfer) => {
                state.held.insert(token, transfer);
            }
        }
        true
    }

    /// Tokens of transfers waiting for [`MockBackend::complete`]
    pub fn held_transfers(&self) -> Vec<TransferId> {
        let mut tokens: Vec<_> = self.lock().held.keys().copied().collect();
        tokens.sort();
        tokens
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of transfers that reached the backend
    pub fn submit_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Submit { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Payloads written to an OUT endpoint, in order
    pub fn written(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock().written.get(&endpoint).cloned().unwrap_or_default()
    }

    pub fn is_halted(&self, device: BackendDeviceId, endpoint: u8) -> bool {
        self.lock().halted.contains(&(device, endpoint))
    }

    /// Interfaces claimed at the simulated OS level
    pub fn claimed_interfaces(&self, device: BackendDeviceId) -> Vec<u8> {
        self.lock()
            .slot(device)
            .map(|s| s.claimed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn kernel_driver_bound(&self, device: BackendDeviceId, interface: u8) -> bool {
        self.lock()
            .slot(device)
            .is_some_and(|s| s.kernel_drivers.contains(&interface))
    }

    pub fn open_handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    /// Finish every held or scheduled transfer of `handles` through `finish`
    fn fail_transfers_of<F>(
        &self,
        state: &mut MockState,
        handles: &HashSet<BackendHandleId>,
        mut finish: F,
    ) where
        F: FnMut(TransferId, Vec<u8>) -> BackendCompletion,
    {
        let mut tokens: Vec<_> = state
            .held
            .iter()
            .filter(|(_, t)| handles.contains(&t.handle))
            .map(|(token, _)| *token)
            .collect();
        tokens.sort();
        for token in tokens {
            if let Some(transfer) = state.held.remove(&token) {
                self.queue.push(finish(token, transfer.buffer));
            }
        }

        let scheduled = &state.scheduled;
        let taken = self.queue.take_scheduled_where(|c| {
            scheduled
                .get(&c.token)
                .is_some_and(|(handle, _)| handles.contains(handle))
        });
        for completion in taken {
            state.scheduled.remove(&completion.token);
            self.queue.push(finish(completion.token, completion.buffer));
        }
    }

    /// Turn a response into a completion, or give the transfer back when it
    /// is to be held
    fn resolve(
        &self,
        state: &mut MockState,
        mut transfer: BackendTransfer,
        response: MockResponse,
    ) -> Result<BackendCompletion, BackendTransfer> {
        let direction = Direction::from_address(transfer.endpoint);
        let device = state.handles.get(&transfer.handle).map(|h| h.device);

        let completion = match response {
            MockResponse::Hold => return Err(transfer),
            MockResponse::Data(data) => match direction {
                Direction::In => {
                    let n = data.len().min(transfer.buffer.len());
                    transfer.buffer[..n].copy_from_slice(&data[..n]);
                    let status = if data.len() > transfer.buffer.len() {
                        BackendStatus::Failed(BackendError::Overflow)
                    } else {
                        BackendStatus::Completed
                    };
                    BackendCompletion::new(transfer.token, status, n, transfer.buffer)
                }
                Direction::Out => {
                    let n = transfer.buffer.len();
                    state
                        .written
                        .entry(transfer.endpoint)
                        .or_default()
                        .push(transfer.buffer.clone());
                    BackendCompletion::new(transfer.token, BackendStatus::Completed, n, transfer.buffer)
                }
            },
            MockResponse::Accept(n) => {
                let n = n.min(transfer.buffer.len());
                state
                    .written
                    .entry(transfer.endpoint)
                    .or_default()
                    .push(transfer.buffer[..n].to_vec());
                BackendCompletion::new(transfer.token, BackendStatus::Completed, n, transfer.buffer)
            }
            MockResponse::Stall => {
                // Control pipes recover on the next setup packet
                if let Some(device) = device.filter(|_| transfer.endpoint & 0x0f != 0) {
                    state.halted.insert((device, transfer.endpoint));
                }
                BackendCompletion::failed(transfer, BackendError::Pipe)
            }
            MockResponse::Fail(error) => BackendCompletion::failed(transfer, error),
            MockResponse::Disconnect => {
                if let Some(slot) = device.and_then(|d| state.slot_mut(d)) {
                    slot.present = false;
                }
                BackendCompletion::failed(transfer, BackendError::NoDevice)
            }
            MockResponse::Isochronous(packets) => {
                let lengths = match &transfer.kind {
                    TransferKind::Isochronous { packet_lengths } => packet_lengths.clone(),
                    _ => return Ok(BackendCompletion::failed(transfer, BackendError::InvalidParam)),
                };
                let mut offset = 0usize;
                let mut total = 0usize;
                let mut results = Vec::with_capacity(lengths.len());
                for (i, length) in lengths.iter().enumerate() {
                    let packet = packets.get(i);
                    let (actual, status) = match packet {
                        Some(MockIsoPacket { error: Some(e), .. }) => {
                            (0, BackendStatus::Failed(e.clone()))
                        }
                        Some(MockIsoPacket { data, .. }) => {
                            let n = data.len().min(*length as usize);
                            let end = (offset + n).min(transfer.buffer.len());
                            let n = end - offset.min(end);
                            if n > 0 {
                                transfer.buffer[offset..end].copy_from_slice(&data[..n]);
                            }
                            (n, BackendStatus::Completed)
                        }
                        None => (0, BackendStatus::Completed),
                    };
                    total += actual;
                    results.push(BackendIsoPacket {
                        length: *length,
                        actual_length: actual as u32,
                        status,
                    });
                    offset += *length as usize;
                }
                BackendCompletion {
                    token: transfer.token,
                    status: BackendStatus::Completed,
                    actual_length: total,
                    buffer: transfer.buffer,
                    iso_packets: results,
                }
            }
        };

        Ok(completion)
    }

    /// Built-in answer for standard control requests, `None` when unscripted
    fn standard_response(state: &MockState, transfer: &BackendTransfer) -> Option<MockResponse> {
        let TransferKind::Control(setup) = &transfer.kind else {
            return None;
        };
        if setup.request != REQUEST_GET_DESCRIPTOR || setup.direction() != Direction::In {
            return None;
        }

        let device = state.handles.get(&transfer.handle)?.device;
        let slot = state.slot(device)?;
        let index = (setup.value & 0xff) as u8;

        let bytes = match (setup.value >> 8) as u8 {
            DT_DEVICE => slot.device.device_descriptor.clone(),
            DT_CONFIG => match slot.device.config_descriptors.get(index as usize) {
                Some(bytes) => bytes.clone(),
                None => return Some(MockResponse::Stall),
            },
            DT_STRING if index == 0 => encode_language_ids(&slot.device.languages),
            DT_STRING => match slot.device.strings.get(&index) {
                Some(text) => encode_string_descriptor(text),
                None => return Some(MockResponse::Stall),
            },
            _ => return Some(MockResponse::Stall),
        };

        // Devices send at most wLength bytes
        let n = bytes.len().min(transfer.buffer.len());
        Some(MockResponse::Data(bytes[..n].to_vec()))
    }
}

impl HostBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_devices(&self) -> BackendResult<Vec<RawDevice>> {
        let mut state = self.lock();
        state.calls.push(MockCall::ListDevices);
        if state.bus_unavailable {
            return Err(BackendError::Other("host controller unavailable".to_string()));
        }

        let mut devices: Vec<RawDevice> = state
            .devices
            .iter()
            .filter(|(_, slot)| slot.present)
            .map(|(id, slot)| RawDevice {
                id: *id,
                bus_number: slot.device.bus_number,
                port_path: slot.device.port_path.clone(),
                address: slot.device.address,
                speed: slot.device.speed,
            })
            .collect();
        if state.reverse_listing {
            devices.reverse();
        }
        Ok(devices)
    }

    fn device_descriptor(&self, device: BackendDeviceId) -> BackendResult<Vec<u8>> {
        let state = self.lock();
        Ok(state.present_slot(device)?.device.device_descriptor.clone())
    }

    fn config_descriptor(&self, device: BackendDeviceId, index: u8) -> BackendResult<Vec<u8>> {
        let state = self.lock();
        state
            .present_slot(device)?
            .device
            .config_descriptors
            .get(index as usize)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn open(&self, device: BackendDeviceId) -> BackendResult<BackendHandleId> {
        let mut state = self.lock();
        state.calls.push(MockCall::Open(device));
        state.take_injected(MockOp::Open)?;
        state.present_slot(device)?;

        state.next_handle += 1;
        let handle = BackendHandleId(state.next_handle);
        state.handles.insert(
            handle,
            HandleSlot {
                device,
                claimed: BTreeSet::new(),
            },
        );
        Ok(handle)
    }

    fn close(&self, handle: BackendHandleId) {
        let mut state = self.lock();
        state.calls.push(MockCall::Close(handle));

        let handles = HashSet::from([handle]);
        self.fail_transfers_of(&mut state, &handles, |token, buffer| {
            BackendCompletion::new(token, BackendStatus::Cancelled, 0, buffer)
        });

        if let Some(slot) = state.handles.remove(&handle) {
            if let Some(device) = state.slot_mut(slot.device) {
                for interface in &slot.claimed {
                    device.claimed.remove(interface);
                }
            }
        }
    }

    fn active_configuration(&self, handle: BackendHandleId) -> BackendResult<u8> {
        let state = self.lock();
        let device = state.handle_device(handle)?;
        Ok(state.present_slot(device)?.active_configuration)
    }

    fn set_configuration(&self, handle: BackendHandleId, value: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::SetConfiguration { handle, value });
        state.take_injected(MockOp::SetConfiguration)?;
        let device = state.handle_device(handle)?;

        if state.handles.get(&handle).is_some_and(|h| !h.claimed.is_empty()) {
            return Err(BackendError::Busy);
        }
        let slot = state.slot_mut(device).ok_or(BackendError::NoDevice)?;
        if value != 0 && !slot.device.configuration_values().contains(&value) {
            return Err(BackendError::NotFound);
        }
        slot.active_configuration = value;
        Ok(())
    }

    fn claim_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::ClaimInterface { handle, interface });
        state.take_injected(MockOp::ClaimInterface)?;
        let device = state.handle_device(handle)?;

        let slot = state.slot_mut(device).ok_or(BackendError::NoDevice)?;
        if slot.kernel_drivers.contains(&interface) || slot.claimed.contains(&interface) {
            return Err(BackendError::Busy);
        }
        slot.claimed.insert(interface);
        if let Some(h) = state.handles.get_mut(&handle) {
            h.claimed.insert(interface);
        }
        Ok(())
    }

    fn release_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::ReleaseInterface { handle, interface });
        state.take_injected(MockOp::ReleaseInterface)?;
        let device = state.handle_device(handle)?;

        let claimed = state
            .handles
            .get_mut(&handle)
            .is_some_and(|h| h.claimed.remove(&interface));
        if !claimed {
            return Err(BackendError::NotFound);
        }
        if let Some(slot) = state.slot_mut(device) {
            slot.claimed.remove(&interface);
        }
        Ok(())
    }

    fn set_alternate_setting(
        &self,
        handle: BackendHandleId,
        interface: u8,
        alternate_setting: u8,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::SetAlternateSetting {
            handle,
            interface,
            alternate_setting,
        });
        state.take_injected(MockOp::SetAlternateSetting)?;
        state.handle_device(handle)?;

        if state.handles.get(&handle).is_some_and(|h| h.claimed.contains(&interface)) {
            Ok(())
        } else {
            Err(BackendError::NotFound)
        }
    }

    fn clear_halt(&self, handle: BackendHandleId, endpoint: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::ClearHalt { handle, endpoint });
        state.take_injected(MockOp::ClearHalt)?;
        let device = state.handle_device(handle)?;
        state.halted.remove(&(device, endpoint));
        Ok(())
    }

    fn reset_device(&self, handle: BackendHandleId) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::ResetDevice(handle));
        state.take_injected(MockOp::ResetDevice)?;
        let device = state.handle_device(handle)?;
        state.halted.retain(|(d, _)| *d != device);
        Ok(())
    }

    fn kernel_driver_active(&self, handle: BackendHandleId, interface: u8) -> BackendResult<bool> {
        let state = self.lock();
        let device = state.handle_device(handle)?;
        Ok(state
            .slot(device)
            .is_some_and(|s| s.kernel_drivers.contains(&interface)))
    }

    fn detach_kernel_driver(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::DetachKernelDriver { handle, interface });
        let device = state.handle_device(handle)?;
        let slot = state.slot_mut(device).ok_or(BackendError::NoDevice)?;
        if slot.kernel_drivers.remove(&interface) {
            Ok(())
        } else {
            Err(BackendError::NotFound)
        }
    }

    fn attach_kernel_driver(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::AttachKernelDriver { handle, interface });
        let device = state.handle_device(handle)?;
        let slot = state.slot_mut(device).ok_or(BackendError::NoDevice)?;
        if slot.claimed.contains(&interface) {
            return Err(BackendError::Busy);
        }
        slot.kernel_drivers.insert(interface);
        Ok(())
    }

    fn submit(&self, transfer: BackendTransfer) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Submit {
            token: transfer.token,
            handle: transfer.handle,
            endpoint: transfer.endpoint,
            transfer_type: transfer.kind.transfer_type(),
            length: transfer.buffer.len(),
        });
        state.take_injected(MockOp::Submit)?;
        let device = state.handle_device(transfer.handle)?;

        let key = (transfer.handle, transfer.endpoint);
        let token = transfer.token;

        let (response, delay) = if state.halted.contains(&(device, transfer.endpoint)) {
            (MockResponse::Fail(BackendError::Pipe), Duration::ZERO)
        } else if let Some(scripted) = state
            .responses
            .get_mut(&transfer.endpoint)
            .and_then(|q| q.pop_front())
        {
            scripted
        } else if let Some(standard) = Self::standard_response(&state, &transfer) {
            (standard, Duration::ZERO)
        } else if transfer.kind.transfer_type() != TransferType::Isochronous
            && Direction::from_address(transfer.endpoint) == Direction::Out
        {
            (MockResponse::Data(Vec::new()), Duration::ZERO)
        } else {
            (MockResponse::Hold, Duration::ZERO)
        };

        match self.resolve(&mut state, transfer, response) {
            Ok(completion) => {
                // Completions on one endpoint never overtake each other
                let scheduled = &state.scheduled;
                let earliest = self
                    .queue
                    .last_due_where(|c| scheduled.get(&c.token) == Some(&key))
                    .unwrap_or_else(Instant::now);
                let due = earliest.max(Instant::now() + delay);
                state.scheduled.insert(token, key);
                self.queue.push_at(due, completion);
            }
            Err(transfer) => {
                state.held.insert(token, transfer);
            }
        }
        Ok(())
    }

    fn cancel(&self, token: TransferId) -> bool {
        let mut state = self.lock();
        state.calls.push(MockCall::Cancel(token));

        if let Some(transfer) = state.held.remove(&token) {
            self.queue.push(BackendCompletion::cancelled(transfer));
            return true;
        }
        if let Some(completion) = self.queue.take_scheduled(token) {
            state.scheduled.remove(&token);
            self.queue.push(BackendCompletion::new(
                token,
                BackendStatus::Cancelled,
                0,
                completion.buffer,
            ));
            return true;
        }
        false
    }

    fn wait_completions(&self, timeout: Duration) -> Vec<BackendCompletion> {
        if self.lock().completions_paused {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Vec::new();
        }
        let completions = self.queue.wait(timeout);
        if !completions.is_empty() {
            let mut state = self.lock();
            for completion in &completions {
                state.scheduled.remove(&completion.token);
            }
        }
        completions
    }

    fn wake(&self) {
        self.queue.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        BULK_IN_EP, BULK_OUT_EP, create_bulk_config_descriptor, create_mock_device_descriptor,
    };

    fn backend_with_device() -> (MockBackend, BackendDeviceId) {
        let mock = MockBackend::new();
        let id = mock.add_device(MockDevice::new(
            1,
            vec![1],
            2,
            create_mock_device_descriptor(0x1234, 0x5678),
            vec![create_bulk_config_descriptor(1)],
        ));
        (mock, id)
    }

    fn bulk(token: u64, handle: BackendHandleId, endpoint: u8, buffer: Vec<u8>) -> BackendTransfer {
        BackendTransfer {
            token: TransferId(token),
            handle,
            endpoint,
            kind: TransferKind::Bulk,
            buffer,
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_out_accepted_by_default() {
        let (mock, id) = backend_with_device();
        let handle = mock.open(id).unwrap();
        mock.submit(bulk(1, handle, BULK_OUT_EP, vec![1, 2, 3])).unwrap();

        let done = mock.wait_completions(Duration::from_secs(1));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, BackendStatus::Completed);
        assert_eq!(done[0].actual_length, 3);
        assert_eq!(mock.written(BULK_OUT_EP), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_in_held_until_completed() {
        let (mock, id) = backend_with_device();
        let handle = mock.open(id).unwrap();
        mock.submit(bulk(1, handle, BULK_IN_EP, vec![0; 8])).unwrap();

        assert!(mock.wait_completions(Duration::from_millis(10)).is_empty());
        assert_eq!(mock.held_transfers(), vec![TransferId(1)]);

        assert!(mock.complete(TransferId(1), MockResponse::Data(vec![9, 9])));
        let done = mock.wait_completions(Duration::from_secs(1));
        assert_eq!(done[0].actual_length, 2);
        assert_eq!(&done[0].buffer[..2], &[9, 9]);
    }

    #[test]
    fn test_cancel_held_and_scheduled() {
        let (mock, id) = backend_with_device();
        let handle = mock.open(id).unwrap();
        mock.respond_after(BULK_IN_EP, MockResponse::Data(vec![1]), Duration::from_secs(10));
        mock.submit(bulk(1, handle, BULK_IN_EP, vec![0; 8])).unwrap();
        mock.submit(bulk(2, handle, BULK_IN_EP, vec![0; 8])).unwrap();

        assert!(mock.cancel(TransferId(1)));
        assert!(mock.cancel(TransferId(2)));
        assert!(!mock.cancel(TransferId(2)));

        let done = mock.wait_completions(Duration::from_secs(1));
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.status == BackendStatus::Cancelled));
    }

    #[test]
    fn test_stall_halts_endpoint() {
        let (mock, id) = backend_with_device();
        let handle = mock.open(id).unwrap();
        mock.respond(BULK_IN_EP, MockResponse::Stall);
        mock.submit(bulk(1, handle, BULK_IN_EP, vec![0; 8])).unwrap();
        assert!(mock.is_halted(id, BULK_IN_EP));

        mock.clear_halt(handle, BULK_IN_EP).unwrap();
        assert!(!mock.is_halted(id, BULK_IN_EP));
    }

    #[test]
    fn test_unplug_fails_in_flight() {
        let (mock, id) = backend_with_device();
        let handle = mock.open(id).unwrap();
        mock.submit(bulk(1, handle, BULK_IN_EP, vec![0; 8])).unwrap();
        mock.unplug(id);

        let done = mock.wait_completions(Duration::from_secs(1));
        assert_eq!(done[0].status, BackendStatus::Failed(BackendError::NoDevice));
        assert_eq!(mock.open(id), Err(BackendError::NoDevice));
    }

    #[test]
    fn test_claim_busy_with_kernel_driver() {
        let mock = MockBackend::new();
        let id = mock.add_device(
            MockDevice::new(
                1,
                vec![1],
                2,
                create_mock_device_descriptor(0x1234, 0x5678),
                vec![create_bulk_config_descriptor(1)],
            )
            .with_kernel_driver(0),
        );
        let handle = mock.open(id).unwrap();
        assert_eq!(mock.claim_interface(handle, 0), Err(BackendError::Busy));
        mock.detach_kernel_driver(handle, 0).unwrap();
        assert!(mock.claim_interface(handle, 0).is_ok());
    }
}
