//! Test utilities for rust-usb-host
//!
//! Descriptor fixtures shared by the crates' test suites, plus a timeout
//! wrapper for async tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, create_bulk_config_descriptor};
//!
//! let device = create_mock_device_descriptor(0x1234, 0x5678);
//! assert_eq!(device.len(), 18);
//!
//! let config = create_bulk_config_descriptor(1);
//! assert_eq!(config[5], 1); // bConfigurationValue
//! ```

use descriptor::{
    BcdVersion, ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, Interface,
    InterfaceDescriptor,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN endpoint of [`create_bulk_config_descriptor`]
pub const BULK_IN_EP: u8 = 0x81;
/// Bulk OUT endpoint of [`create_bulk_config_descriptor`]
pub const BULK_OUT_EP: u8 = 0x02;
/// Interrupt IN endpoint of [`create_bulk_config_descriptor`]
pub const INTERRUPT_IN_EP: u8 = 0x83;
/// Isochronous IN endpoint on interface 1 alt 1 of [`create_iso_config_descriptor`]
pub const ISO_IN_EP: u8 = 0x84;

/// Device descriptor structure with the given IDs and one configuration
pub fn mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: BcdVersion(0x0200),
        class_code: 0x00,
        sub_class_code: 0x00,
        protocol_code: 0x00,
        max_packet_size_0: 64,
        vendor_id,
        product_id,
        device_version: BcdVersion(0x0100),
        manufacturer_string_index: 1,
        product_string_index: 2,
        serial_number_string_index: 3,
        num_configurations: 1,
    }
}

/// Raw 18-byte device descriptor with the given IDs
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
    mock_device_descriptor(vendor_id, product_id).encode()
}

/// Raw device descriptor declaring `num_configurations` configurations
pub fn create_device_descriptor_with_configs(
    vendor_id: u16,
    product_id: u16,
    num_configurations: u8,
) -> Vec<u8> {
    DeviceDescriptor {
        num_configurations,
        ..mock_device_descriptor(vendor_id, product_id)
    }
    .encode()
}

/// Endpoint descriptor value
pub fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        raw_max_packet_size: max_packet_size,
        interval,
        refresh: None,
        synch_address: None,
        ss_companion: None,
        extra: Vec::new(),
    }
}

/// Interface alternate setting with vendor class and the given endpoints
pub fn interface_alt(
    number: u8,
    alternate_setting: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        interface_number: number,
        alternate_setting,
        num_endpoints: endpoints.len() as u8,
        class_code: 0xff,
        sub_class_code: 0x00,
        protocol_code: 0x00,
        interface_string_index: 0,
        endpoints,
        extra: Vec::new(),
    }
}

/// Configuration value built from interfaces
pub fn config_descriptor(configuration_value: u8, interfaces: Vec<Interface>) -> ConfigDescriptor {
    let mut config = ConfigDescriptor {
        total_length: 0,
        num_interfaces: interfaces.len() as u8,
        configuration_value,
        configuration_string_index: 0,
        attributes: 0x80,
        max_power: 50,
        interfaces,
        extra: Vec::new(),
    };
    config.total_length = config.encoded_len() as u16;
    config
}

/// Configuration with one vendor interface (0) carrying bulk IN 0x81,
/// bulk OUT 0x02 and interrupt IN 0x83
pub fn bulk_config(configuration_value: u8) -> ConfigDescriptor {
    config_descriptor(
        configuration_value,
        vec![Interface {
            number: 0,
            alt_settings: vec![interface_alt(
                0,
                0,
                vec![
                    endpoint(BULK_IN_EP, 0x02, 512, 0),
                    endpoint(BULK_OUT_EP, 0x02, 512, 0),
                    endpoint(INTERRUPT_IN_EP, 0x03, 64, 4),
                ],
            )],
        }],
    )
}

/// Raw bytes of [`bulk_config`]
pub fn create_bulk_config_descriptor(configuration_value: u8) -> Vec<u8> {
    bulk_config(configuration_value).encode()
}

/// Raw configuration with the bulk interface 0 plus an isochronous
/// interface 1 whose alternate setting 1 carries iso IN 0x84
pub fn create_iso_config_descriptor(configuration_value: u8) -> Vec<u8> {
    let mut config = bulk_config(configuration_value);
    config.interfaces.push(Interface {
        number: 1,
        alt_settings: vec![
            interface_alt(1, 0, Vec::new()),
            interface_alt(1, 1, vec![endpoint(ISO_IN_EP, 0x05, 192, 1)]),
        ],
    });
    config.num_interfaces = 2;
    config.encode()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
