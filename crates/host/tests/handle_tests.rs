//! Handle lifecycle integration tests
//!
//! Open and close, configuration selection, interface claims across
//! handles, alternate settings and kernel driver handling.
//!
//! Run with: `cargo test -p host --test handle_tests`

mod support;

use common::test_utils::{
    BULK_IN_EP, ISO_IN_EP, create_iso_config_descriptor, create_mock_device_descriptor,
};
use host::backend::mock::{MockCall, MockDevice, MockOp};
use host::{BackendError, Context, ContextOptions, Transfer, UsbError};
use std::sync::Arc;
use std::time::Duration;
use support::{bulk_device, context_with, open_claimed, setup, test_options};

#[test]
fn test_open_and_close() {
    let (mock, context, device) = setup();

    let handle = context.open(&device).unwrap();
    assert_eq!(context.open_handles(), 1);
    assert_eq!(mock.open_handle_count(), 1);
    assert_eq!(handle.device(), &device);

    handle.close().unwrap();
    assert_eq!(context.open_handles(), 0);
    assert_eq!(mock.open_handle_count(), 0);
}

#[test]
fn test_drop_closes_handle() {
    let (mock, context, device) = setup();
    {
        let _handle = context.open(&device).unwrap();
        assert_eq!(mock.open_handle_count(), 1);
    }
    assert_eq!(context.open_handles(), 0);
    assert_eq!(mock.open_handle_count(), 0);
}

#[test]
fn test_close_twice_is_invalid_handle() {
    let (_, context, device) = setup();
    let handle = context.open(&device).unwrap();
    let id = handle.id();

    context.close_handle(id).unwrap();
    assert_eq!(context.close_handle(id), Err(UsbError::InvalidHandle));

    // The wrapper notices the handle is already closed
    drop(handle);
    assert_eq!(context.open_handles(), 0);
}

#[test]
fn test_operations_on_closed_handle_fail() {
    let (_, context, device) = setup();
    let handle = context.open(&device).unwrap();
    let id = handle.id();
    context.close_handle(id).unwrap();

    assert_eq!(context.set_configuration(id, 1), Err(UsbError::InvalidHandle));
    assert_eq!(context.claim_interface(id, 0), Err(UsbError::InvalidHandle));
    assert_eq!(context.active_configuration(id), Err(UsbError::InvalidHandle));
}

#[test]
fn test_open_limit() {
    let mock = Arc::new(host::backend::mock::MockBackend::new());
    mock.add_device(bulk_device());
    let options = ContextOptions {
        max_open_handles: 2,
        ..test_options()
    };
    let context = Context::new(mock.clone(), options).unwrap();
    let device = context.enumerate().unwrap().into_devices().remove(0);

    let _a = context.open(&device).unwrap();
    let _b = context.open(&device).unwrap();
    assert!(matches!(
        context.open(&device),
        Err(UsbError::TooManyOpenHandles)
    ));
    assert_eq!(mock.open_handle_count(), 2);
}

#[test]
fn test_open_access_denied() {
    let (mock, context, device) = setup();
    mock.fail_next(MockOp::Open, BackendError::Access);

    assert!(matches!(context.open(&device), Err(UsbError::AccessDenied)));
    assert!(context.open(&device).is_ok());
}

#[test]
fn test_set_configuration() {
    let (_, context, device) = setup();
    let handle = context.open(&device).unwrap();
    assert_eq!(handle.active_configuration().unwrap(), None);

    handle.set_configuration(1).unwrap();
    assert_eq!(handle.active_configuration().unwrap(), Some(1));

    assert!(matches!(
        handle.set_configuration(7),
        Err(UsbError::InvalidParam(_))
    ));
    assert_eq!(handle.active_configuration().unwrap(), Some(1));

    handle.set_configuration(0).unwrap();
    assert_eq!(handle.active_configuration().unwrap(), None);
}

#[test]
fn test_open_reads_active_configuration() {
    let (_, context) = context_with(vec![bulk_device().with_active_configuration(1)]);
    let device = context.enumerate().unwrap().into_devices().remove(0);

    let handle = context.open(&device).unwrap();
    assert_eq!(handle.active_configuration().unwrap(), Some(1));
    handle.claim_interface(0).unwrap();
}

#[test]
fn test_configuration_is_shared_between_handles() {
    let (mock, context) = context_with(vec![bulk_device().with_active_configuration(1)]);
    let device = context.enumerate().unwrap().into_devices().remove(0);
    let first = context.open(&device).unwrap();
    let second = context.open(&device).unwrap();
    assert_eq!(second.active_configuration().unwrap(), Some(1));

    first.set_configuration(0).unwrap();
    assert_eq!(first.active_configuration().unwrap(), None);
    assert_eq!(second.active_configuration().unwrap(), None);

    assert!(matches!(
        second.claim_interface(0),
        Err(UsbError::InvalidParam(_))
    ));
    let err = second
        .submit_transfer(Transfer::bulk_in(BULK_IN_EP, 8, Duration::ZERO), |_| {})
        .unwrap_err();
    assert_eq!(err, UsbError::EndpointNotClaimed(BULK_IN_EP));
    assert_eq!(mock.submit_count(), 0);

    second.set_configuration(1).unwrap();
    assert_eq!(first.active_configuration().unwrap(), Some(1));
    first.claim_interface(0).unwrap();
}

#[test]
fn test_set_configuration_with_claimed_interfaces() {
    let (mock, context, device) = setup();
    let handle = open_claimed(&context, &device);
    mock.clear_calls();

    assert_eq!(
        handle.set_configuration(1),
        Err(UsbError::InterfacesStillClaimed(vec![0]))
    );
    assert!(
        !mock
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SetConfiguration { .. }))
    );

    handle.release_interface(0).unwrap();
    handle.set_configuration(1).unwrap();
}

#[test]
fn test_claim_requires_configuration() {
    let (_, context, device) = setup();
    let handle = context.open(&device).unwrap();

    assert!(matches!(
        handle.claim_interface(0),
        Err(UsbError::InvalidParam(_))
    ));

    handle.set_configuration(1).unwrap();
    assert!(matches!(
        handle.claim_interface(5),
        Err(UsbError::InvalidParam(_))
    ));
}

#[test]
fn test_claim_is_idempotent() {
    let (mock, context, device) = setup();
    let handle = open_claimed(&context, &device);
    mock.clear_calls();

    handle.claim_interface(0).unwrap();
    assert!(mock.calls().is_empty());
    assert_eq!(handle.claimed_interfaces().unwrap(), vec![0]);
}

#[test]
fn test_interface_busy_across_handles() {
    let (_, context, device) = setup();
    let first = open_claimed(&context, &device);
    let second = context.open(&device).unwrap();

    assert_eq!(second.claim_interface(0), Err(UsbError::InterfaceBusy(0)));

    first.release_interface(0).unwrap();
    second.claim_interface(0).unwrap();
    assert_eq!(second.claimed_interfaces().unwrap(), vec![0]);
}

#[test]
fn test_release_unclaimed_interface() {
    let (_, context, device) = setup();
    let handle = context.open(&device).unwrap();
    handle.set_configuration(1).unwrap();

    assert!(matches!(
        handle.release_interface(0),
        Err(UsbError::InvalidParam(_))
    ));
}

#[test]
fn test_close_releases_claims() {
    let (mock, context) = context_with(Vec::new());
    let id = mock.add_device(bulk_device());
    let device = context.enumerate().unwrap().into_devices().remove(0);

    let handle = open_claimed(&context, &device);
    assert_eq!(mock.claimed_interfaces(id), vec![0]);

    handle.close().unwrap();
    assert!(mock.claimed_interfaces(id).is_empty());

    let again = open_claimed(&context, &device);
    assert_eq!(again.claimed_interfaces().unwrap(), vec![0]);
}

#[test]
fn test_kernel_driver_detached_and_reattached() {
    let (mock, context) = context_with(Vec::new());
    let id = mock.add_device(bulk_device().with_kernel_driver(0));
    let device = context.enumerate().unwrap().into_devices().remove(0);

    let handle = open_claimed(&context, &device);
    assert!(!mock.kernel_driver_bound(id, 0));

    handle.release_interface(0).unwrap();
    assert!(mock.kernel_driver_bound(id, 0));
}

#[test]
fn test_kernel_driver_blocks_claim_without_auto_detach() {
    let mock = Arc::new(host::backend::mock::MockBackend::new());
    mock.add_device(bulk_device().with_kernel_driver(0));
    let options = ContextOptions {
        auto_detach_kernel_driver: false,
        ..test_options()
    };
    let context = Context::new(mock.clone(), options).unwrap();
    let device = context.enumerate().unwrap().into_devices().remove(0);

    let handle = context.open(&device).unwrap();
    handle.set_configuration(1).unwrap();
    assert_eq!(handle.claim_interface(0), Err(UsbError::InterfaceBusy(0)));
    assert!(handle.claimed_interfaces().unwrap().is_empty());
}

#[test]
fn test_alternate_settings() {
    let (_, context) = context_with(vec![MockDevice::new(
        2,
        vec![4],
        9,
        create_mock_device_descriptor(0x1234, 0x9999),
        vec![create_iso_config_descriptor(1)],
    )]);
    let device = context.enumerate().unwrap().into_devices().remove(0);
    let handle = context.open(&device).unwrap();
    handle.set_configuration(1).unwrap();

    assert!(matches!(
        handle.set_alternate_setting(1, 1),
        Err(UsbError::InvalidParam(_))
    ));

    handle.claim_interface(1).unwrap();
    assert!(matches!(
        handle.set_alternate_setting(1, 4),
        Err(UsbError::InvalidParam(_))
    ));
    handle.set_alternate_setting(1, 1).unwrap();

    // Reset returns every interface to alternate setting 0, where the
    // isochronous endpoint does not exist
    handle.reset().unwrap();
    let transfer = host::Transfer::isochronous(ISO_IN_EP, vec![0; 192], vec![192], std::time::Duration::ZERO);
    assert_eq!(
        handle.submit_transfer(transfer, |_| {}).unwrap_err(),
        UsbError::EndpointNotClaimed(ISO_IN_EP)
    );
}

#[test]
fn test_open_unplugged_device_without_reenumerating() {
    let (mock, context) = context_with(Vec::new());
    let id = mock.add_device(bulk_device());
    let device = context.enumerate().unwrap().into_devices().remove(0);

    mock.unplug(id);
    assert!(!device.is_gone());

    assert!(matches!(context.open(&device), Err(UsbError::DeviceGone)));
    assert!(device.is_gone());
    assert_eq!(context.open_handles(), 0);
}

#[test]
fn test_reset_on_reenumerated_device_reports_gone() {
    let (mock, context, device) = setup();
    let handle = context.open(&device).unwrap();
    mock.fail_next(MockOp::ResetDevice, BackendError::NotFound);

    assert_eq!(handle.reset(), Err(UsbError::DeviceGone));
    assert!(device.is_gone());
}

#[test]
fn test_shutdown_closes_handles() {
    let (mock, context, device) = setup();
    let handle = open_claimed(&context, &device);

    context.shutdown();
    context.shutdown();
    assert!(context.is_shut_down());
    assert_eq!(mock.open_handle_count(), 0);
    assert_eq!(handle.claimed_interfaces(), Err(UsbError::InvalidHandle));
    assert!(matches!(
        context.open(&device),
        Err(UsbError::HostControllerUnavailable(_))
    ));
}
