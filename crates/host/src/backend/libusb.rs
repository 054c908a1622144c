//! libusb host controller via rusb
//!
//! rusb exposes blocking transfer calls only, so every endpoint in use gets a
//! worker thread that runs its transfers one at a time in submission order
//! and reports results through a shared [`CompletionQueue`]. Each blocking
//! call is bounded by [`ATTEMPT_TIMEOUT`]; between attempts the worker checks
//! whether its transfer was cancelled or the handle closed, so a transfer
//! already inside libusb can still be cancelled.
//!
//! rusb hands out parsed descriptors, so the raw bytes the host stack parses
//! are rebuilt from them here.

use super::{
    BackendCompletion, BackendDeviceId, BackendError, BackendHandleId, BackendResult,
    BackendStatus, BackendTransfer, CompletionQueue, HostBackend, RawDevice,
};
use crate::device::Speed;
use crate::error::UsbError;
use crate::transfer::{TransferId, TransferKind};
use descriptor::constants::{
    CONFIG_DESCRIPTOR_SIZE, DT_CONFIG, DT_ENDPOINT, DT_INTERFACE, ENDPOINT_DESCRIPTOR_SIZE,
    ENDPOINT_DIR_MASK, INTERFACE_DESCRIPTOR_SIZE,
};
use descriptor::{BcdVersion, DeviceDescriptor, Direction};
use rusb::UsbContext;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

type RusbHandle = rusb::DeviceHandle<rusb::Context>;

/// Longest a single blocking libusb call runs before the worker looks for a
/// cancellation
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transfers waiting for one endpoint's worker
#[derive(Default)]
struct WorkQueue {
    state: Mutex<WorkState>,
    ready: Condvar,
}

#[derive(Default)]
struct WorkState {
    queued: VecDeque<BackendTransfer>,
    /// Transfer the worker is executing
    running: Option<TransferId>,
    /// Set when `running` has been cancelled
    abort: bool,
    shutdown: bool,
}

/// Where a cancelled transfer was found
#[derive(Debug)]
enum Cancellation {
    /// Not started yet; handed back to the caller
    Queued(BackendTransfer),
    /// The worker will stop it at its next attempt boundary
    Running,
    Unknown,
}

impl WorkQueue {
    fn push(&self, transfer: BackendTransfer) -> BackendResult<()> {
        let mut state = lock(&self.state);
        if state.shutdown {
            return Err(BackendError::NoDevice);
        }
        state.queued.push_back(transfer);
        self.ready.notify_one();
        Ok(())
    }

    /// Next transfer to run, `None` once shut down
    fn next(&self) -> Option<BackendTransfer> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(transfer) = state.queued.pop_front() {
                state.running = Some(transfer.token);
                state.abort = false;
                return Some(transfer);
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// The worker is done with the transfer `next` returned
    fn finish(&self) {
        let mut state = lock(&self.state);
        state.running = None;
        state.abort = false;
    }

    fn cancel(&self, token: TransferId) -> Cancellation {
        let mut state = lock(&self.state);
        if state.running == Some(token) {
            state.abort = true;
            return Cancellation::Running;
        }
        match state.queued.iter().position(|t| t.token == token) {
            Some(position) => state
                .queued
                .remove(position)
                .map_or(Cancellation::Unknown, Cancellation::Queued),
            None => Cancellation::Unknown,
        }
    }

    /// Whether the running transfer should stop
    fn should_stop(&self) -> bool {
        let state = lock(&self.state);
        state.abort || state.shutdown
    }

    /// Stop the worker and hand back everything it had not started
    fn shutdown(&self) -> Vec<BackendTransfer> {
        let mut state = lock(&self.state);
        state.shutdown = true;
        self.ready.notify_all();
        state.queued.drain(..).collect()
    }
}

struct EndpointWorker {
    queue: Arc<WorkQueue>,
    thread: thread::JoinHandle<()>,
}

impl EndpointWorker {
    fn spawn(
        label: String,
        device: Arc<RusbHandle>,
        completions: Arc<CompletionQueue>,
    ) -> BackendResult<Self> {
        let queue = Arc::new(WorkQueue::default());
        let worker_queue = queue.clone();
        let thread = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                trace!("{} started", label);
                while let Some(transfer) = worker_queue.next() {
                    let completion =
                        execute_transfer(&device, transfer, || worker_queue.should_stop());
                    worker_queue.finish();
                    completions.push(completion);
                }
                trace!("{} stopped", label);
            })
            .map_err(|e| BackendError::Other(format!("failed to spawn endpoint worker: {}", e)))?;

        Ok(Self { queue, thread })
    }

    /// Stop the worker, hand back the transfers it had not started and
    /// wait for the running one to give up its native handle
    fn stop(self, completions: &CompletionQueue) {
        for transfer in self.queue.shutdown() {
            completions.push(BackendCompletion::cancelled(transfer));
        }
        if self.thread.join().is_err() {
            warn!("Endpoint worker panicked");
        }
    }
}

struct OpenHandle {
    device: Arc<RusbHandle>,
    workers: Mutex<HashMap<u8, EndpointWorker>>,
}

/// [`HostBackend`] on the system's libusb
pub struct RusbBackend {
    context: rusb::Context,
    devices: Mutex<HashMap<BackendDeviceId, rusb::Device<rusb::Context>>>,
    handles: Mutex<HashMap<BackendHandleId, Arc<OpenHandle>>>,
    next_handle: AtomicU64,
    completions: Arc<CompletionQueue>,
}

impl RusbBackend {
    /// Initialise libusb
    pub fn new() -> Result<Self, UsbError> {
        let context = rusb::Context::new().map_err(|e| {
            UsbError::HostControllerUnavailable(format!("libusb initialisation failed: {}", e))
        })?;
        info!("Initialised libusb {}", version_string());

        Ok(Self {
            context,
            devices: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            completions: Arc::new(CompletionQueue::new()),
        })
    }

    fn device(&self, id: BackendDeviceId) -> BackendResult<rusb::Device<rusb::Context>> {
        lock(&self.devices)
            .get(&id)
            .cloned()
            .ok_or(BackendError::NoDevice)
    }

    fn handle(&self, id: BackendHandleId) -> BackendResult<Arc<OpenHandle>> {
        lock(&self.handles)
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }
}

fn version_string() -> String {
    let version = rusb::version();
    format!(
        "{}.{}.{}.{}",
        version.major(),
        version.minor(),
        version.micro(),
        version.nano()
    )
}

impl HostBackend for RusbBackend {
    fn name(&self) -> &'static str {
        "libusb"
    }

    fn list_devices(&self) -> BackendResult<Vec<RawDevice>> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let mut devices = HashMap::new();
        let mut raw = Vec::new();
        for device in list.iter() {
            let id = device_id(device.bus_number(), device.address());
            let port_path = device.port_numbers().unwrap_or_else(|e| {
                debug!(
                    "No port numbers for device {}:{}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                Vec::new()
            });
            raw.push(RawDevice {
                id,
                bus_number: device.bus_number(),
                port_path,
                address: device.address(),
                speed: map_device_speed(device.speed()),
            });
            devices.insert(id, device);
        }

        *lock(&self.devices) = devices;
        Ok(raw)
    }

    fn device_descriptor(&self, device: BackendDeviceId) -> BackendResult<Vec<u8>> {
        let descriptor = self
            .device(device)?
            .device_descriptor()
            .map_err(map_rusb_error)?;
        Ok(encode_device_descriptor(&descriptor))
    }

    fn config_descriptor(&self, device: BackendDeviceId, index: u8) -> BackendResult<Vec<u8>> {
        let config = self
            .device(device)?
            .config_descriptor(index)
            .map_err(map_rusb_error)?;
        Ok(encode_config_descriptor(&config))
    }

    fn open(&self, device: BackendDeviceId) -> BackendResult<BackendHandleId> {
        let handle = self.device(device)?.open().map_err(map_rusb_error)?;
        let id = BackendHandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));

        lock(&self.handles).insert(
            id,
            Arc::new(OpenHandle {
                device: Arc::new(handle),
                workers: Mutex::new(HashMap::new()),
            }),
        );
        debug!("Opened libusb handle {}", id.0);
        Ok(id)
    }

    fn close(&self, handle: BackendHandleId) {
        let Some(open) = lock(&self.handles).remove(&handle) else {
            return;
        };

        let workers: Vec<EndpointWorker> = lock(&open.workers).drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop(&self.completions);
        }
        debug!("Closed libusb handle {}", handle.0);
    }

    fn active_configuration(&self, handle: BackendHandleId) -> BackendResult<u8> {
        self.handle(handle)?
            .device
            .active_configuration()
            .map_err(map_rusb_error)
    }

    fn set_configuration(&self, handle: BackendHandleId, value: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(
        &self,
        handle: BackendHandleId,
        interface: u8,
        alternate_setting: u8,
    ) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .set_alternate_setting(interface, alternate_setting)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, handle: BackendHandleId, endpoint: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn reset_device(&self, handle: BackendHandleId) -> BackendResult<()> {
        self.handle(handle)?.device.reset().map_err(map_rusb_error)
    }

    fn kernel_driver_active(&self, handle: BackendHandleId, interface: u8) -> BackendResult<bool> {
        if !rusb::supports_detach_kernel_driver() {
            return Ok(false);
        }
        self.handle(handle)?
            .device
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .detach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn attach_kernel_driver(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()> {
        self.handle(handle)?
            .device
            .attach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn submit(&self, transfer: BackendTransfer) -> BackendResult<()> {
        if matches!(transfer.kind, TransferKind::Isochronous { .. }) {
            // rusb has no synchronous isochronous call
            return Err(BackendError::NotSupported);
        }

        let open = self.handle(transfer.handle)?;
        let endpoint = transfer.endpoint;
        let mut workers = lock(&open.workers);
        let worker = match workers.entry(endpoint) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let label = format!("usb-h{}-ep{:02x}", transfer.handle.0, endpoint);
                entry.insert(EndpointWorker::spawn(
                    label,
                    open.device.clone(),
                    self.completions.clone(),
                )?)
            }
        };
        worker.queue.push(transfer)
    }

    fn cancel(&self, token: TransferId) -> bool {
        let handles: Vec<Arc<OpenHandle>> = lock(&self.handles).values().cloned().collect();
        for open in handles {
            let workers = lock(&open.workers);
            for worker in workers.values() {
                match worker.queue.cancel(token) {
                    Cancellation::Queued(transfer) => {
                        self.completions.push(BackendCompletion::cancelled(transfer));
                        return true;
                    }
                    Cancellation::Running => return true,
                    Cancellation::Unknown => {}
                }
            }
        }
        false
    }

    fn wait_completions(&self, timeout: Duration) -> Vec<BackendCompletion> {
        self.completions.wait(timeout)
    }

    fn wake(&self) {
        self.completions.wake();
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        let ids: Vec<BackendHandleId> = lock(&self.handles).keys().copied().collect();
        if !ids.is_empty() {
            warn!("Closing {} libusb handles left open", ids.len());
        }
        for id in ids {
            self.close(id);
        }
    }
}

/// Run one transfer on the calling thread, in attempts of at most
/// [`ATTEMPT_TIMEOUT`], until it finishes, its timeout passes or `stop` says
/// it was cancelled
fn execute_transfer<S>(device: &RusbHandle, transfer: BackendTransfer, stop: S) -> BackendCompletion
where
    S: Fn() -> bool,
{
    let BackendTransfer {
        token,
        endpoint,
        kind,
        mut buffer,
        timeout,
        ..
    } = transfer;
    let is_in = endpoint & ENDPOINT_DIR_MASK != 0;
    let total = buffer.len();

    let (status, moved) = match &kind {
        TransferKind::Control(setup) => match setup.direction() {
            Direction::In => run_attempts(total, timeout, false, &stop, |_, slice| {
                device.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buffer,
                    slice,
                )
            }),
            Direction::Out => run_attempts(total, timeout, false, &stop, |_, slice| {
                device.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &buffer,
                    slice,
                )
            }),
        },
        TransferKind::Bulk if is_in => run_attempts(total, timeout, false, &stop, |_, slice| {
            device.read_bulk(endpoint, &mut buffer, slice)
        }),
        TransferKind::Bulk => run_attempts(total, timeout, true, &stop, |offset, slice| {
            device.write_bulk(endpoint, &buffer[offset..], slice)
        }),
        TransferKind::Interrupt if is_in => run_attempts(total, timeout, false, &stop, |_, slice| {
            device.read_interrupt(endpoint, &mut buffer, slice)
        }),
        TransferKind::Interrupt => run_attempts(total, timeout, true, &stop, |offset, slice| {
            device.write_interrupt(endpoint, &buffer[offset..], slice)
        }),
        TransferKind::Isochronous { .. } => (BackendStatus::Failed(BackendError::NotSupported), 0),
    };

    match &status {
        BackendStatus::Completed => {
            trace!("{} on endpoint {:#04x} moved {} bytes", token, endpoint, moved)
        }
        BackendStatus::Cancelled => {
            debug!("{} on endpoint {:#04x} stopped after {} bytes", token, endpoint, moved)
        }
        BackendStatus::Failed(e) => {
            debug!("{} on endpoint {:#04x} failed: {}", token, endpoint, e)
        }
    }
    BackendCompletion::new(token, status, moved, buffer)
}

/// Drive `attempt` until the transfer is done
///
/// `attempt` gets the offset reached so far and the time it may block.
/// A zero `timeout` never expires. OUT data transfers are `resumable`: a
/// short write at an attempt boundary continues from where it stopped
/// instead of resending. Returns the terminal status and the bytes moved.
fn run_attempts<S, F>(
    total: usize,
    timeout: Duration,
    resumable: bool,
    stop: &S,
    mut attempt: F,
) -> (BackendStatus, usize)
where
    S: Fn() -> bool,
    F: FnMut(usize, Duration) -> rusb::Result<usize>,
{
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
    let mut offset = 0;

    loop {
        if stop() {
            return (BackendStatus::Cancelled, offset);
        }
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return (BackendStatus::Failed(BackendError::Timeout), offset);
                }
                remaining.min(ATTEMPT_TIMEOUT)
            }
            None => ATTEMPT_TIMEOUT,
        };

        match attempt(offset, slice) {
            Ok(n) => {
                offset += n;
                if !resumable || offset >= total {
                    return (BackendStatus::Completed, offset);
                }
            }
            Err(rusb::Error::Timeout | rusb::Error::Interrupted) => {}
            Err(e) => return (BackendStatus::Failed(map_rusb_error(e)), offset),
        }
    }
}

/// Device ids are stable for as long as the device keeps its bus address
fn device_id(bus_number: u8, address: u8) -> BackendDeviceId {
    BackendDeviceId(u64::from(bus_number) << 8 | u64::from(address))
}

fn map_device_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

pub(crate) fn map_rusb_error(err: rusb::Error) -> BackendError {
    match err {
        rusb::Error::Access => BackendError::Access,
        rusb::Error::NoDevice => BackendError::NoDevice,
        rusb::Error::NotFound => BackendError::NotFound,
        rusb::Error::Busy => BackendError::Busy,
        rusb::Error::Timeout => BackendError::Timeout,
        rusb::Error::Pipe => BackendError::Pipe,
        rusb::Error::Overflow => BackendError::Overflow,
        rusb::Error::Io => BackendError::Io,
        rusb::Error::InvalidParam => BackendError::InvalidParam,
        rusb::Error::NoMem => BackendError::NoMem,
        rusb::Error::NotSupported => BackendError::NotSupported,
        rusb::Error::Interrupted => BackendError::Interrupted,
        other => BackendError::Other(other.to_string()),
    }
}

fn bcd(version: rusb::Version) -> BcdVersion {
    let major = version.major();
    BcdVersion(
        u16::from(major / 10) << 12
            | u16::from(major % 10) << 8
            | u16::from(version.minor() & 0x0f) << 4
            | u16::from(version.sub_minor() & 0x0f),
    )
}

fn encode_device_descriptor(descriptor: &rusb::DeviceDescriptor) -> Vec<u8> {
    DeviceDescriptor {
        usb_version: bcd(descriptor.usb_version()),
        class_code: descriptor.class_code(),
        sub_class_code: descriptor.sub_class_code(),
        protocol_code: descriptor.protocol_code(),
        max_packet_size_0: descriptor.max_packet_size(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_version: bcd(descriptor.device_version()),
        manufacturer_string_index: descriptor.manufacturer_string_index().unwrap_or(0),
        product_string_index: descriptor.product_string_index().unwrap_or(0),
        serial_number_string_index: descriptor.serial_number_string_index().unwrap_or(0),
        num_configurations: descriptor.num_configurations(),
    }
    .encode()
}

fn transfer_type_bits(transfer_type: rusb::TransferType) -> u8 {
    match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

fn sync_type_bits(sync_type: rusb::SyncType) -> u8 {
    match sync_type {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    }
}

fn usage_type_bits(usage_type: rusb::UsageType) -> u8 {
    match usage_type {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    }
}

/// Rebuild the wire form of a configuration, class-specific descriptors
/// included
fn encode_config_descriptor(config: &rusb::ConfigDescriptor) -> Vec<u8> {
    let mut body = Vec::new();
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            body.push(INTERFACE_DESCRIPTOR_SIZE as u8);
            body.push(DT_INTERFACE);
            body.push(alt.interface_number());
            body.push(alt.setting_number());
            body.push(alt.num_endpoints());
            body.push(alt.class_code());
            body.push(alt.sub_class_code());
            body.push(alt.protocol_code());
            body.push(alt.description_string_index().unwrap_or(0));
            body.extend_from_slice(alt.extra());

            for endpoint in alt.endpoint_descriptors() {
                body.push(ENDPOINT_DESCRIPTOR_SIZE as u8);
                body.push(DT_ENDPOINT);
                body.push(endpoint.address());
                body.push(
                    transfer_type_bits(endpoint.transfer_type())
                        | sync_type_bits(endpoint.sync_type()) << 2
                        | usage_type_bits(endpoint.usage_type()) << 4,
                );
                body.extend_from_slice(&endpoint.max_packet_size().to_le_bytes());
                body.push(endpoint.interval());
                if let Some(extra) = endpoint.extra() {
                    body.extend_from_slice(extra);
                }
            }
        }
    }

    let mut attributes = 0x80;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    let extra = config.extra();
    let total_length = CONFIG_DESCRIPTOR_SIZE + extra.len() + body.len();

    let mut out = Vec::with_capacity(total_length);
    out.push(CONFIG_DESCRIPTOR_SIZE as u8);
    out.push(DT_CONFIG);
    out.extend_from_slice(&(total_length.min(usize::from(u16::MAX)) as u16).to_le_bytes());
    out.push(config.num_interfaces());
    out.push(config.number());
    out.push(config.description_string_index().unwrap_or(0));
    out.push(attributes);
    out.push((config.max_power() / 2).min(u16::from(u8::MAX)) as u8);
    out.extend_from_slice(extra);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), Speed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), Speed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), Speed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), Speed::Super);
        assert_eq!(map_device_speed(rusb::Speed::SuperPlus), Speed::SuperPlus);
        assert_eq!(map_device_speed(rusb::Speed::Unknown), Speed::Unknown);
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), BackendError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), BackendError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), BackendError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Busy), BackendError::Busy);
        assert!(matches!(
            map_rusb_error(rusb::Error::Other),
            BackendError::Other(_)
        ));
    }

    #[test]
    fn test_device_id_layout() {
        assert_eq!(device_id(1, 2), BackendDeviceId(0x0102));
        assert_ne!(device_id(1, 2), device_id(2, 1));
    }

    #[test]
    fn test_endpoint_attribute_bits() {
        let iso_async_feedback = transfer_type_bits(rusb::TransferType::Isochronous)
            | sync_type_bits(rusb::SyncType::Asynchronous) << 2
            | usage_type_bits(rusb::UsageType::Feedback) << 4;
        assert_eq!(iso_async_feedback, 0x15);
        assert_eq!(transfer_type_bits(rusb::TransferType::Bulk), 0x02);
    }

    #[test]
    fn test_work_queue_cancel_and_shutdown() {
        let queue = WorkQueue::default();
        for n in 1..=3 {
            queue
                .push(BackendTransfer {
                    token: TransferId(n),
                    handle: BackendHandleId(1),
                    endpoint: 0x81,
                    kind: TransferKind::Bulk,
                    buffer: vec![0; 8],
                    timeout: Duration::ZERO,
                })
                .unwrap();
        }

        assert!(matches!(
            queue.cancel(TransferId(2)),
            Cancellation::Queued(t) if t.token == TransferId(2)
        ));
        assert!(matches!(queue.cancel(TransferId(2)), Cancellation::Unknown));
        assert_eq!(queue.next().map(|t| t.token), Some(TransferId(1)));

        let left = queue.shutdown();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].token, TransferId(3));
        assert!(queue.next().is_none());
        assert_eq!(
            queue.push(BackendTransfer {
                token: TransferId(4),
                handle: BackendHandleId(1),
                endpoint: 0x81,
                kind: TransferKind::Bulk,
                buffer: Vec::new(),
                timeout: Duration::ZERO,
            }),
            Err(BackendError::NoDevice)
        );
    }

    fn queued_transfer(token: u64) -> BackendTransfer {
        BackendTransfer {
            token: TransferId(token),
            handle: BackendHandleId(1),
            endpoint: 0x81,
            kind: TransferKind::Bulk,
            buffer: vec![0; 8],
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_cancel_running_transfer() {
        let queue = WorkQueue::default();
        queue.push(queued_transfer(1)).unwrap();
        queue.push(queued_transfer(2)).unwrap();

        assert_eq!(queue.next().map(|t| t.token), Some(TransferId(1)));
        assert!(!queue.should_stop());
        assert!(matches!(queue.cancel(TransferId(1)), Cancellation::Running));
        assert!(queue.should_stop());

        queue.finish();
        assert!(matches!(queue.cancel(TransferId(1)), Cancellation::Unknown));
        assert_eq!(queue.next().map(|t| t.token), Some(TransferId(2)));
        assert!(!queue.should_stop());

        queue.shutdown();
        assert!(queue.should_stop());
    }

    #[test]
    fn test_unbounded_transfer_stops_when_cancelled() {
        let attempts = std::cell::Cell::new(0);
        let stop = || attempts.get() >= 3;

        let (status, moved) = run_attempts(64, Duration::ZERO, false, &stop, |_, slice| {
            assert_eq!(slice, ATTEMPT_TIMEOUT);
            attempts.set(attempts.get() + 1);
            Err(rusb::Error::Timeout)
        });

        assert_eq!(status, BackendStatus::Cancelled);
        assert_eq!(moved, 0);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_write_resumes_from_offset() {
        let mut offsets = Vec::new();
        let mut answers = vec![Ok(5), Err(rusb::Error::Timeout), Ok(3)].into_iter();

        let (status, moved) = run_attempts(8, Duration::ZERO, true, &|| false, |offset, _| {
            offsets.push(offset);
            answers.next().unwrap_or(Err(rusb::Error::Other))
        });

        assert_eq!(status, BackendStatus::Completed);
        assert_eq!(moved, 8);
        assert_eq!(offsets, vec![0, 5, 5]);
    }

    #[test]
    fn test_cancel_keeps_bytes_already_written() {
        let cancelled = std::cell::Cell::new(false);
        let (status, moved) = run_attempts(8, Duration::ZERO, true, &|| cancelled.get(), |_, _| {
            cancelled.set(true);
            Ok(4)
        });

        assert_eq!(status, BackendStatus::Cancelled);
        assert_eq!(moved, 4);
    }

    #[test]
    fn test_deadline_spans_attempts() {
        let timeout = Duration::from_millis(30);
        let started = Instant::now();

        let (status, _) = run_attempts(8, timeout, false, &|| false, |_, slice| {
            assert!(slice <= timeout);
            thread::sleep(slice);
            Err(rusb::Error::Timeout)
        });

        assert_eq!(status, BackendStatus::Failed(BackendError::Timeout));
        assert!(started.elapsed() >= timeout);
    }

    #[test]
    fn test_short_read_completes() {
        let (status, moved) = run_attempts(64, Duration::from_secs(1), false, &|| false, |_, _| Ok(10));
        assert_eq!(status, BackendStatus::Completed);
        assert_eq!(moved, 10);
    }

    #[test]
    fn test_failure_ends_transfer() {
        let (status, _) = run_attempts(8, Duration::ZERO, true, &|| false, |_, _| Err(rusb::Error::Pipe));
        assert_eq!(status, BackendStatus::Failed(BackendError::Pipe));
    }
}
