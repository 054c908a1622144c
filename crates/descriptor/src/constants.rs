//! Standard USB constants (USB 2.0 chapter 9, USB 3.x chapter 9)

/// Device descriptor type
pub const DT_DEVICE: u8 = 0x01;
/// Configuration descriptor type
pub const DT_CONFIG: u8 = 0x02;
/// String descriptor type
pub const DT_STRING: u8 = 0x03;
/// Interface descriptor type
pub const DT_INTERFACE: u8 = 0x04;
/// Endpoint descriptor type
pub const DT_ENDPOINT: u8 = 0x05;
/// Interface association descriptor type
pub const DT_INTERFACE_ASSOCIATION: u8 = 0x0b;
/// Binary device object store descriptor type
pub const DT_BOS: u8 = 0x0f;
/// HID class descriptor type
pub const DT_HID: u8 = 0x21;
/// SuperSpeed endpoint companion descriptor type
pub const DT_SS_ENDPOINT_COMPANION: u8 = 0x30;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;
/// Audio-class endpoints carry bRefresh and bSynchAddress
pub const ENDPOINT_AUDIO_DESCRIPTOR_SIZE: usize = 9;
pub const SS_ENDPOINT_COMPANION_SIZE: usize = 6;
pub const SETUP_PACKET_SIZE: usize = 8;

// Standard requests (bRequest)
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;
pub const REQUEST_SYNCH_FRAME: u8 = 0x0c;

/// Feature selector for CLEAR_FEATURE / SET_FEATURE on an endpoint
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Direction bit in bEndpointAddress and bmRequestType
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;
pub const TRANSFER_TYPE_MASK: u8 = 0x03;

// bmRequestType fields
pub const REQUEST_TYPE_STANDARD: u8 = 0x00 << 5;
pub const REQUEST_TYPE_CLASS: u8 = 0x01 << 5;
pub const REQUEST_TYPE_VENDOR: u8 = 0x02 << 5;
pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;
pub const RECIPIENT_OTHER: u8 = 0x03;

/// US English language ID, the usual default for string descriptors
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;
