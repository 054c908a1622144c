//! USB host stack for rust-usb-host
//!
//! This crate enumerates devices on a host controller, opens them, manages
//! configurations and interface claims, and moves data over control, bulk,
//! interrupt and isochronous endpoints. All native I/O goes through a
//! [`HostBackend`]: [`RusbBackend`](backend::libusb::RusbBackend) drives the
//! system's libusb, [`MockBackend`](backend::mock::MockBackend) simulates a
//! bus in memory for tests.
//!
//! # Architecture
//!
//! - [`Context`] owns one backend and a dedicated event loop thread
//! - The registry turns backend device lists into [`Device`] snapshots
//!   keyed by bus and port path
//! - The handle manager tracks open handles, the active configuration and
//!   which interfaces each handle has claimed
//! - The transfer engine validates transfers and hands them to the event
//!   loop, which enforces timeouts, routes cancellation and invokes every
//!   completion callback exactly once
//!
//! Blocking transfers ride the same asynchronous path and wait for their
//! own completion, so they must not be issued from a completion callback.
//!
//! # Example
//!
//! ```no_run
//! use host::{Context, ContextOptions};
//! use std::time::Duration;
//!
//! # fn main() -> host::Result<()> {
//! let context = Context::with_libusb(ContextOptions::default())?;
//! let devices = context.enumerate()?;
//!
//! if let Some(device) = devices.by_vid_pid(0x1234, 0x5678).next() {
//!     let handle = context.open(device)?;
//!     handle.set_configuration(1)?;
//!     handle.claim_interface(0)?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = handle.read_bulk(0x81, &mut buf, Duration::from_secs(1))?;
//!     println!("read {} bytes", n);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod context;
pub mod device;
pub mod device_handle;
pub mod engine;
pub mod error;
mod event_loop;
pub mod handle;
pub mod registry;
pub mod transfer;

pub use backend::{BackendError, HostBackend};
pub use context::{Context, ContextOptions};
pub use device::{Device, DeviceKey, Speed};
pub use device_handle::DeviceHandle;
pub use engine::TransferFuture;
pub use error::{Result, UsbError};
pub use handle::HandleId;
pub use registry::{DeviceList, EnumerationError};
pub use transfer::{
    CompletedTransfer, IsoPacketResult, Transfer, TransferId, TransferKind, TransferStatus,
};
