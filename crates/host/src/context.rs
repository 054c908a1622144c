//! Host context
//!
//! A [`Context`] ties one backend to its registry, handle manager, transfer
//! engine and event loop thread. Contexts are cheap to clone; the event loop
//! stops when [`Context::shutdown`] is called or the last clone is dropped.

use crate::backend::HostBackend;
use crate::backend::libusb::RusbBackend;
use crate::device::Device;
use crate::device_handle::DeviceHandle;
use crate::engine::{TransferEngine, TransferFuture};
use crate::error::{Result, UsbError};
use crate::event_loop::EventLoop;
use crate::handle::{HandleId, HandleManager};
use crate::registry::{DeviceList, Registry};
use crate::transfer::{CompletedTransfer, Transfer, TransferId};
use common::{DeviceFilter, HostConfig};
use descriptor::SetupPacket;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Enumerate only devices matching one of these; empty allows all
    pub filters: Vec<DeviceFilter>,
    pub max_open_handles: usize,
    /// Detach kernel drivers on claim and reattach them on release
    pub auto_detach_kernel_driver: bool,
    /// Longest the event loop sleeps when no deadline is near
    pub poll_interval: Duration,
    /// How long closing a handle (or the context) waits for cancelled
    /// transfers to come back
    pub close_drain_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        let config = HostConfig::default();
        Self {
            filters: Vec::new(),
            max_open_handles: config.usb.max_open_handles,
            auto_detach_kernel_driver: config.usb.auto_detach_kernel_driver,
            poll_interval: config.event_loop.poll_interval(),
            close_drain_timeout: config.event_loop.close_drain_timeout(),
        }
    }
}

impl ContextOptions {
    /// Options from a loaded configuration file
    pub fn from_config(config: &HostConfig) -> common::Result<Self> {
        Ok(Self {
            filters: config.usb.parsed_filters()?,
            max_open_handles: config.usb.max_open_handles,
            auto_detach_kernel_driver: config.usb.auto_detach_kernel_driver,
            poll_interval: config.event_loop.poll_interval(),
            close_drain_timeout: config.event_loop.close_drain_timeout(),
        })
    }
}

struct ContextInner {
    backend: Arc<dyn HostBackend>,
    registry: Registry,
    handles: Arc<HandleManager>,
    engine: TransferEngine,
    event_loop: Arc<EventLoop>,
    thread: Mutex<Option<JoinHandle<()>>>,
    options: ContextOptions,
    shut_down: AtomicBool,
}

impl ContextInner {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(UsbError::HostControllerUnavailable(
                "context has been shut down".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn close_handle(&self, id: HandleId) -> Result<()> {
        let entry = self.handles.begin_close(id)?;

        let remaining = self
            .event_loop
            .cancel_handle(id, self.options.close_drain_timeout);
        if remaining > 0 {
            warn!(
                "{} transfers of {} still pending after close drain",
                remaining, id
            );
        }

        self.handles.finish_close(&entry);
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down {} context", self.backend.name());

        for id in self.handles.open_ids() {
            if let Err(e) = self.close_handle(id) {
                debug!("Closing {} during shutdown failed: {}", id, e);
            }
        }

        self.event_loop.request_shutdown();

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if self.event_loop.is_loop_thread() {
                // Dropped from a callback; the loop exits after it returns
                return;
            }
            if thread.join().is_err() {
                warn!("USB event loop thread panicked");
            }
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point of the host stack
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context over `backend` and start its event loop
    pub fn new(backend: Arc<dyn HostBackend>, options: ContextOptions) -> Result<Self> {
        let event_loop = EventLoop::new(
            backend.clone(),
            options.poll_interval,
            options.close_drain_timeout,
        );
        let thread = event_loop.spawn()?;

        let handles = Arc::new(HandleManager::new(
            backend.clone(),
            options.max_open_handles,
            options.auto_detach_kernel_driver,
        ));

        info!("Created USB context on {} backend", backend.name());

        Ok(Self {
            inner: Arc::new(ContextInner {
                registry: Registry::new(backend.clone(), options.filters.clone()),
                engine: TransferEngine::new(handles.clone(), event_loop.clone()),
                backend,
                handles,
                event_loop,
                thread: Mutex::new(Some(thread)),
                options,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Create a context on the system's libusb
    pub fn with_libusb(options: ContextOptions) -> Result<Self> {
        let backend = RusbBackend::new()?;
        Self::new(Arc::new(backend), options)
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Snapshot of the devices currently on the bus
    pub fn enumerate(&self) -> Result<DeviceList> {
        self.inner.ensure_running()?;
        self.inner.registry.enumerate()
    }

    /// Open a device; the handle closes itself when dropped
    pub fn open(&self, device: &Device) -> Result<DeviceHandle> {
        self.inner.ensure_running()?;
        let entry = self.inner.handles.open(device)?;
        Ok(DeviceHandle::new(entry.id, device.clone(), self.clone()))
    }

    /// Close a handle: cancel its transfers, wait for them to settle (bounded
    /// by the close drain timeout), release its interfaces and close the
    /// native handle. A second close fails with `InvalidHandle`.
    pub fn close_handle(&self, handle: HandleId) -> Result<()> {
        self.inner.close_handle(handle)
    }

    pub fn active_configuration(&self, handle: HandleId) -> Result<Option<u8>> {
        self.inner.handles.active_configuration(handle)
    }

    pub fn set_configuration(&self, handle: HandleId, value: u8) -> Result<()> {
        self.inner.handles.set_configuration(handle, value)
    }

    pub fn claim_interface(&self, handle: HandleId, interface: u8) -> Result<()> {
        self.inner.handles.claim_interface(handle, interface)
    }

    pub fn release_interface(&self, handle: HandleId, interface: u8) -> Result<()> {
        self.inner.handles.release_interface(handle, interface)
    }

    pub fn claimed_interfaces(&self, handle: HandleId) -> Result<Vec<u8>> {
        self.inner.handles.claimed_interfaces(handle)
    }

    pub fn set_alternate_setting(&self, handle: HandleId, interface: u8, alternate_setting: u8) -> Result<()> {
        self.inner
            .handles
            .set_alternate_setting(handle, interface, alternate_setting)
    }

    pub fn clear_halt(&self, handle: HandleId, endpoint: u8) -> Result<()> {
        self.inner.handles.clear_halt(handle, endpoint)
    }

    pub fn reset_device(&self, handle: HandleId) -> Result<()> {
        self.inner.handles.reset_device(handle)
    }

    /// Submit a transfer; `callback` runs once on the event loop thread
    pub fn submit_transfer<F>(&self, handle: HandleId, transfer: Transfer, callback: F) -> Result<TransferId>
    where
        F: FnOnce(CompletedTransfer) + Send + 'static,
    {
        self.inner.engine.submit(handle, transfer, Box::new(callback))
    }

    pub fn submit_transfer_async(&self, handle: HandleId, transfer: Transfer) -> Result<TransferFuture> {
        self.inner.engine.submit_async(handle, transfer)
    }

    /// Request cancellation. Returns false when the transfer already
    /// finished; a transfer that completes before the cancel takes effect
    /// keeps its genuine status.
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        self.inner.engine.cancel(id)
    }

    /// Blocking control transfer; returns the data-stage byte count
    pub fn control_transfer(
        &self,
        handle: HandleId,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.inner.engine.control_transfer(handle, setup, data, timeout)
    }

    pub fn bulk_transfer(&self, handle: HandleId, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        self.inner.engine.bulk_transfer(handle, endpoint, data, timeout)
    }

    pub fn interrupt_transfer(
        &self,
        handle: HandleId,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.inner
            .engine
            .interrupt_transfer(handle, endpoint, data, timeout)
    }

    pub fn pending_transfers(&self) -> usize {
        self.inner.event_loop.pending_count()
    }

    pub fn open_handles(&self) -> usize {
        self.inner.handles.open_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Close every handle, cancel every pending transfer and stop the event
    /// loop. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.backend.name())
            .field("open_handles", &self.open_handles())
            .field("pending_transfers", &self.pending_transfers())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
