//! USB descriptor model for rust-usb-host
//!
//! This crate defines the descriptor value types (device, configuration,
//! interface, endpoint, string), pure parsers that turn raw descriptor bytes
//! into those types, and encoders that turn them back into bytes. It also
//! carries the standard control-request framing (the setup packet) that the
//! host layer uses to read descriptors from endpoint 0.
//!
//! Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use descriptor::{parse_config_descriptor, TransferType, Direction};
//!
//! let bytes = [
//!     0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // configuration
//!     0x09, 0x04, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00, // interface 0
//!     0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,             // bulk IN 0x81
//! ];
//!
//! let (config, next) = parse_config_descriptor(&bytes, 0).unwrap();
//! assert_eq!(next, bytes.len());
//!
//! let (_, endpoint) = config.find_endpoint(0x81, |_| 0).unwrap();
//! assert_eq!(endpoint.transfer_type(), TransferType::Bulk);
//! assert_eq!(endpoint.direction(), Direction::In);
//! assert_eq!(config.encode(), bytes);
//! ```

pub mod constants;
pub mod encode;
pub mod error;
pub mod parse;
pub mod types;

pub use encode::{encode_language_ids, encode_string_descriptor};
pub use error::{DescriptorError, Result};
pub use parse::{
    DescriptorHeader, parse_config_descriptor, parse_device_descriptor, parse_endpoint_descriptor,
    parse_header, parse_interface_descriptor, parse_language_ids, parse_ss_endpoint_companion,
    parse_string_descriptor,
};
pub use types::{
    BcdVersion, ConfigDescriptor, DeviceDescriptor, Direction, EndpointDescriptor, Interface,
    InterfaceDescriptor, SetupPacket, SuperSpeedEndpointCompanion, SyncType, TransferType,
    UnknownDescriptor, UsageType, request_type,
};
