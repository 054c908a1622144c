//! Native host controller boundary
//!
//! [`HostBackend`] is the only place the host stack touches the operating
//! system. The context, handle manager and transfer engine are written
//! against this trait, so the libusb backend and the in-memory mock are
//! interchangeable.
//!
//! Completion model: `submit` hands the transfer over, and its result later
//! comes back exactly once through `wait_completions`. `cancel` returns
//! `true` when the backend still owned the transfer and will report it as
//! [`BackendStatus::Cancelled`]; `false` means the genuine completion is
//! already on its way.

pub mod libusb;
pub mod mock;
mod queue;

pub use queue::CompletionQueue;

use crate::device::Speed;
use crate::error::UsbError;
use crate::transfer::{TransferId, TransferKind};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a backend, mirroring the native error codes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("pipe error (stall)")]
    Pipe,
    #[error("overflow")]
    Overflow,
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported")]
    NotSupported,
    #[error("interrupted")]
    Interrupted,
    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for UsbError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Access => UsbError::AccessDenied,
            BackendError::NoDevice => UsbError::DeviceGone,
            BackendError::Timeout => UsbError::TransferTimedOut,
            BackendError::Pipe => UsbError::TransferStalled,
            BackendError::Overflow => UsbError::TransferOverflow,
            BackendError::Interrupted => UsbError::TransferCancelled,
            BackendError::InvalidParam | BackendError::NotFound => {
                UsbError::InvalidParam(format!("rejected by host controller: {}", err))
            }
            other => UsbError::InternalHostError(other.to_string()),
        }
    }
}

impl BackendError {
    /// Error for a transfer that finished with this status
    ///
    /// Differs from the plain conversion in that a missing device means the
    /// device went away mid-transfer.
    pub fn into_transfer_error(self) -> UsbError {
        match self {
            BackendError::NoDevice => UsbError::Disconnected,
            other => other.into(),
        }
    }
}

/// Backend-scoped device reference, valid until the device disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendDeviceId(pub u64);

/// Backend-scoped open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandleId(pub u64);

/// One device as seen on the bus, before any descriptor is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub id: BackendDeviceId,
    pub bus_number: u8,
    /// Hub port chain from the root hub, empty for root devices
    pub port_path: Vec<u8>,
    pub address: u8,
    pub speed: Speed,
}

/// A transfer owned by the backend between submit and completion
#[derive(Debug)]
pub struct BackendTransfer {
    pub token: TransferId,
    pub handle: BackendHandleId,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    /// Requested timeout, zero for none. The event loop enforces it too;
    /// backends built on blocking calls also stop at it.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Completed,
    /// Acknowledges an accepted `cancel`
    Cancelled,
    Failed(BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIsoPacket {
    pub length: u32,
    pub actual_length: u32,
    pub status: BackendStatus,
}

/// Result of one submitted transfer
#[derive(Debug)]
pub struct BackendCompletion {
    pub token: TransferId,
    pub status: BackendStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<BackendIsoPacket>,
}

impl BackendCompletion {
    pub fn new(token: TransferId, status: BackendStatus, actual_length: usize, buffer: Vec<u8>) -> Self {
        Self {
            token,
            status,
            actual_length,
            buffer,
            iso_packets: Vec::new(),
        }
    }

    /// Cancellation acknowledgement carrying the buffer back
    pub fn cancelled(transfer: BackendTransfer) -> Self {
        Self::new(transfer.token, BackendStatus::Cancelled, 0, transfer.buffer)
    }

    pub fn failed(transfer: BackendTransfer, error: BackendError) -> Self {
        Self::new(transfer.token, BackendStatus::Failed(error), 0, transfer.buffer)
    }
}

/// Operations the host stack needs from the native USB stack
pub trait HostBackend: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn list_devices(&self) -> BackendResult<Vec<RawDevice>>;

    /// Raw 18-byte device descriptor
    fn device_descriptor(&self, device: BackendDeviceId) -> BackendResult<Vec<u8>>;

    /// Raw configuration descriptor chain for configuration `index` (not value)
    fn config_descriptor(&self, device: BackendDeviceId, index: u8) -> BackendResult<Vec<u8>>;

    fn open(&self, device: BackendDeviceId) -> BackendResult<BackendHandleId>;

    /// Release the native handle. Transfers still owned by the backend for
    /// this handle complete as cancelled.
    fn close(&self, handle: BackendHandleId);

    /// Active configuration value, 0 when unconfigured
    fn active_configuration(&self, handle: BackendHandleId) -> BackendResult<u8>;

    fn set_configuration(&self, handle: BackendHandleId, value: u8) -> BackendResult<()>;

    fn claim_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()>;

    fn release_interface(&self, handle: BackendHandleId, interface: u8) -> BackendResult<()>;

    fn set_alternate_setting(
        &self,
        handle: BackendHandleId,
        interface: u8,
        alternate_setting: u8,
    ) -> BackendResult<()>;

    fn clear_halt(&self, handle: BackendHandleId, endpoint: u8) -> BackendResult<()>;

    fn reset_device(&self, handle: BackendHandleId) -> BackendResult<()>;

    fn kernel_driver_active(&self, _handle: BackendHandleId, _interface: u8) -> BackendResult<bool> {
        Ok(false)
    }

    fn detach_kernel_driver(&self, _handle: BackendHandleId, _interface: u8) -> BackendResult<()> {
        Err(BackendError::NotSupported)
    }

    fn attach_kernel_driver(&self, _handle: BackendHandleId, _interface: u8) -> BackendResult<()> {
        Err(BackendError::NotSupported)
    }

    /// Take ownership of a transfer. On error nothing will be reported for
    /// its token.
    fn submit(&self, transfer: BackendTransfer) -> BackendResult<()>;

    fn cancel(&self, token: TransferId) -> bool;

    /// Block until at least one completion is available, `wake` is called,
    /// or `timeout` elapses
    fn wait_completions(&self, timeout: Duration) -> Vec<BackendCompletion>;

    /// Interrupt a concurrent `wait_completions`
    fn wake(&self);
}
