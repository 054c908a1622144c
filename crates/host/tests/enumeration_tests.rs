//! Enumeration integration tests
//!
//! Device snapshots, stable keys across enumerations, filters and
//! per-device descriptor failures.
//!
//! Run with: `cargo test -p host --test enumeration_tests`

mod support;

use common::test_utils::{create_bulk_config_descriptor, create_mock_device_descriptor};
use host::backend::mock::{MockBackend, MockDevice};
use host::{Context, ContextOptions, DeviceKey, Speed, UsbError};
use std::sync::Arc;
use support::{bulk_device, context_with, test_options};

fn device_at(port_path: Vec<u8>, address: u8, vid: u16, pid: u16) -> MockDevice {
    MockDevice::new(
        1,
        port_path,
        address,
        create_mock_device_descriptor(vid, pid),
        vec![create_bulk_config_descriptor(1)],
    )
}

#[test]
fn test_enumerate_reports_descriptors() {
    let (_, context) = context_with(vec![bulk_device().with_speed(Speed::Super)]);

    let list = context.enumerate().unwrap();
    assert_eq!(list.len(), 1);

    let device = list.devices().next().unwrap();
    assert_eq!(device.vendor_id(), 0x1234);
    assert_eq!(device.product_id(), 0x5678);
    assert_eq!(device.key(), &DeviceKey::new(1, vec![1]));
    assert_eq!(device.address(), 2);
    assert_eq!(device.speed(), Speed::Super);
    assert_eq!(device.configurations().len(), 1);
    assert!(device.configuration(1).is_some());
    assert!(!device.is_gone());
}

#[test]
fn test_enumerate_twice_yields_same_keys() {
    let (mock, context) = context_with(vec![
        device_at(vec![1], 2, 0x1234, 0x0001),
        device_at(vec![2, 1], 3, 0x1234, 0x0002),
        device_at(vec![3], 4, 0xabcd, 0x0003),
    ]);

    let mut first: Vec<DeviceKey> = context
        .enumerate()
        .unwrap()
        .devices()
        .map(|d| d.key().clone())
        .collect();

    mock.set_reverse_listing(true);
    let mut second: Vec<DeviceKey> = context
        .enumerate()
        .unwrap()
        .devices()
        .map(|d| d.key().clone())
        .collect();

    first.sort();
    second.sort();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[test]
fn test_snapshots_of_one_attachment_compare_equal() {
    let (_, context) = context_with(vec![bulk_device()]);

    let a = context.enumerate().unwrap().into_devices().remove(0);
    let b = context.enumerate().unwrap().into_devices().remove(0);
    assert_eq!(a, b);
}

#[test]
fn test_unplugged_device_is_marked_gone() {
    let (mock, context) = context_with(Vec::new());
    let id = mock.add_device(bulk_device());

    let device = context.enumerate().unwrap().into_devices().remove(0);
    assert!(!device.is_gone());

    mock.unplug(id);
    let list = context.enumerate().unwrap();
    assert!(list.is_empty());
    assert!(device.is_gone());

    assert!(matches!(context.open(&device), Err(UsbError::DeviceGone)));
}

#[test]
fn test_broken_descriptor_does_not_hide_other_devices() {
    let mut broken = device_at(vec![2], 3, 0x1234, 0x0002);
    broken.device_descriptor.truncate(10);

    let (_, context) = context_with(vec![device_at(vec![1], 2, 0x1234, 0x0001), broken]);

    let list = context.enumerate().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.devices().count(), 1);

    let errors: Vec<_> = list.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key, DeviceKey::new(1, vec![2]));
    assert!(matches!(errors[0].error, UsbError::MalformedDescriptor(_)));
}

#[test]
fn test_filters_limit_enumeration() {
    let mock = Arc::new(MockBackend::new());
    mock.add_device(device_at(vec![1], 2, 0x1234, 0x0001));
    mock.add_device(device_at(vec![2], 3, 0xabcd, 0x0002));

    let options = ContextOptions {
        filters: vec!["0xabcd:*".parse().unwrap()],
        ..test_options()
    };
    let context = Context::new(mock.clone(), options).unwrap();

    let list = context.enumerate().unwrap();
    let vendors: Vec<u16> = list.devices().map(|d| d.vendor_id()).collect();
    assert_eq!(vendors, vec![0xabcd]);
    assert_eq!(list.by_vid_pid(0xabcd, 0x0002).count(), 1);
    assert_eq!(list.by_vid_pid(0x1234, 0x0001).count(), 0);
}

#[test]
fn test_unreachable_bus_fails_enumeration() {
    let (mock, context) = context_with(vec![bulk_device()]);
    mock.set_bus_unavailable(true);

    assert!(matches!(
        context.enumerate(),
        Err(UsbError::HostControllerUnavailable(_))
    ));
}

#[test]
fn test_enumerate_after_shutdown_fails() {
    let (_, context) = context_with(vec![bulk_device()]);
    context.shutdown();

    assert!(context.is_shut_down());
    assert!(context.enumerate().is_err());
}
