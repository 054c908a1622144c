//! Shared setup for the host integration tests

#![allow(dead_code)]

use common::test_utils::{create_bulk_config_descriptor, create_mock_device_descriptor};
use host::backend::mock::{MockBackend, MockDevice};
use host::transfer::CompletedTransfer;
use host::{Context, ContextOptions, Device, DeviceHandle};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

/// How long a test waits for a callback before failing
pub const CALLBACK_WAIT: Duration = Duration::from_secs(5);

pub const VENDOR_ID: u16 = 0x1234;
pub const PRODUCT_ID: u16 = 0x5678;

pub fn test_options() -> ContextOptions {
    ContextOptions {
        poll_interval: Duration::from_millis(10),
        close_drain_timeout: Duration::from_millis(500),
        ..ContextOptions::default()
    }
}

/// Bulk device on bus 1, port 1, address 2
pub fn bulk_device() -> MockDevice {
    MockDevice::new(
        1,
        vec![1],
        2,
        create_mock_device_descriptor(VENDOR_ID, PRODUCT_ID),
        vec![create_bulk_config_descriptor(1)],
    )
}

/// Context over a mock bus holding `devices`
pub fn context_with(devices: Vec<MockDevice>) -> (Arc<MockBackend>, Context) {
    let mock = Arc::new(MockBackend::new());
    for device in devices {
        mock.add_device(device);
    }
    let context = Context::new(mock.clone(), test_options()).unwrap();
    (mock, context)
}

/// Context with one bulk device, already enumerated
pub fn setup() -> (Arc<MockBackend>, Context, Device) {
    let (mock, context) = context_with(vec![bulk_device()]);
    let device = context.enumerate().unwrap().into_devices().remove(0);
    (mock, context, device)
}

/// Open the bulk device, select configuration 1 and claim interface 0
pub fn open_claimed(context: &Context, device: &Device) -> DeviceHandle {
    let handle = context.open(device).unwrap();
    handle.set_configuration(1).unwrap();
    handle.claim_interface(0).unwrap();
    handle
}

/// Callback that forwards the completed transfer to a channel
pub fn channel_callback() -> (
    impl FnOnce(CompletedTransfer) + Send + 'static,
    mpsc::Receiver<CompletedTransfer>,
) {
    let (tx, rx) = mpsc::channel();
    let callback = move |completed: CompletedTransfer| {
        let _ = tx.send(completed);
    };
    (callback, rx)
}
