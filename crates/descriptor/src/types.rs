//! USB descriptor type definitions
//!
//! Plain value types mirroring the standard descriptors. Field names follow
//! their meaning rather than the raw `bFoo`/`wBar` spelling; raw values are
//! kept so that encoding reproduces the bytes that were parsed.

use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary-coded decimal version number (bcdUSB, bcdDevice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BcdVersion(pub u16);

impl BcdVersion {
    pub fn major(self) -> u8 {
        let hi = (self.0 >> 8) as u8;
        (hi >> 4) * 10 + (hi & 0x0f)
    }

    pub fn minor(self) -> u8 {
        ((self.0 >> 4) & 0x0f) as u8
    }

    pub fn sub_minor(self) -> u8 {
        (self.0 & 0x0f) as u8
    }
}

impl fmt::Display for BcdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.sub_minor())
    }
}

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB specification release (bcdUSB)
    pub usb_version: BcdVersion,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    /// Maximum packet size of endpoint 0
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub device_version: BcdVersion,
    pub manufacturer_string_index: u8,
    pub product_string_index: u8,
    pub serial_number_string_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Manufacturer string index, `None` when the device declares no string
    pub fn manufacturer_string(&self) -> Option<u8> {
        non_zero(self.manufacturer_string_index)
    }

    pub fn product_string(&self) -> Option<u8> {
        non_zero(self.product_string_index)
    }

    pub fn serial_number_string(&self) -> Option<u8> {
        non_zero(self.serial_number_string_index)
    }
}

/// Configuration descriptor with its full interface tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// wTotalLength as declared by the device
    pub total_length: u16,
    pub num_interfaces: u8,
    /// Value passed to SET_CONFIGURATION to select this configuration
    pub configuration_value: u8,
    pub configuration_string_index: u8,
    pub attributes: u8,
    /// bMaxPower in device units (2 mA, or 8 mA for SuperSpeed)
    pub max_power: u8,
    /// Interfaces in the order their first alternate setting appeared
    pub interfaces: Vec<Interface>,
    /// Descriptors between the configuration header and the first interface
    pub extra: Vec<UnknownDescriptor>,
}

impl ConfigDescriptor {
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    /// Maximum power draw in milliamps
    pub fn max_power_ma(&self, super_speed: bool) -> u16 {
        let unit = if super_speed { 8 } else { 2 };
        u16::from(self.max_power) * unit
    }

    /// Interface with the given number
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    /// Locate an endpoint by address, looking only at the alternate setting
    /// `selected_alt` returns for each interface number.
    pub fn find_endpoint<F>(
        &self,
        address: u8,
        selected_alt: F,
    ) -> Option<(&InterfaceDescriptor, &EndpointDescriptor)>
    where
        F: Fn(u8) -> u8,
    {
        self.interfaces.iter().find_map(|interface| {
            let alt = interface.alt_setting(selected_alt(interface.number))?;
            alt.endpoints
                .iter()
                .find(|ep| ep.address == address)
                .map(|ep| (alt, ep))
        })
    }
}

/// An interface number and all of its alternate settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    pub number: u8,
    pub alt_settings: Vec<InterfaceDescriptor>,
}

impl Interface {
    pub fn alt_setting(&self, alternate_setting: u8) -> Option<&InterfaceDescriptor> {
        self.alt_settings
            .iter()
            .find(|a| a.alternate_setting == alternate_setting)
    }
}

/// Interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub interface_string_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class-specific or vendor descriptors following the interface header
    pub extra: Vec<UnknownDescriptor>,
}

/// Endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (direction bit | endpoint number)
    pub address: u8,
    /// bmAttributes (transfer type, sync type, usage type)
    pub attributes: u8,
    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits
    pub raw_max_packet_size: u16,
    pub interval: u8,
    /// Audio-class extension (9-byte endpoint descriptors)
    pub refresh: Option<u8>,
    pub synch_address: Option<u8>,
    pub ss_companion: Option<SuperSpeedEndpointCompanion>,
    pub extra: Vec<UnknownDescriptor>,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    pub fn sync_type(&self) -> SyncType {
        match (self.attributes >> 2) & 0x03 {
            0 => SyncType::NoSync,
            1 => SyncType::Asynchronous,
            2 => SyncType::Adaptive,
            _ => SyncType::Synchronous,
        }
    }

    pub fn usage_type(&self) -> UsageType {
        match (self.attributes >> 4) & 0x03 {
            0 => UsageType::Data,
            1 => UsageType::Feedback,
            2 => UsageType::FeedbackData,
            _ => UsageType::Reserved,
        }
    }

    /// Packet size in bytes, without the multiplier bits
    pub fn max_packet_size(&self) -> u16 {
        self.raw_max_packet_size & 0x07ff
    }

    /// Transactions per microframe for high-bandwidth endpoints (1..=3)
    pub fn transactions_per_microframe(&self) -> u8 {
        (((self.raw_max_packet_size >> 11) & 0x03) as u8) + 1
    }
}

/// SuperSpeed endpoint companion descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuperSpeedEndpointCompanion {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

/// Descriptor of a type this model does not interpret
///
/// `data` holds the complete descriptor including its two-byte header, so it
/// can be written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnknownDescriptor {
    pub descriptor_type: u8,
    pub data: Vec<u8>,
}

/// Endpoint / request direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The four USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & TRANSFER_TYPE_MASK {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferType::Control => "control",
            TransferType::Isochronous => "isochronous",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// Isochronous synchronization type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    NoSync,
    Asynchronous,
    Adaptive,
    Synchronous,
}

/// Isochronous usage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageType {
    Data,
    Feedback,
    FeedbackData,
    Reserved,
}

/// The eight-byte setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Direction of the data stage, taken from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    /// GET_DESCRIPTOR request addressed to the device
    pub fn get_descriptor(descriptor_type: u8, index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: request_type(Direction::In, REQUEST_TYPE_STANDARD, RECIPIENT_DEVICE),
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(index),
            index: language_id,
            length,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) for the given endpoint
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self {
            request_type: request_type(Direction::Out, REQUEST_TYPE_STANDARD, RECIPIENT_ENDPOINT),
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: u16::from(endpoint),
            length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Compose a bmRequestType byte
pub fn request_type(direction: Direction, kind: u8, recipient: u8) -> u8 {
    let dir = match direction {
        Direction::In => ENDPOINT_DIR_MASK,
        Direction::Out => 0,
    };
    dir | kind | recipient
}

fn non_zero(index: u8) -> Option<u8> {
    if index == 0 { None } else { Some(index) }
}
