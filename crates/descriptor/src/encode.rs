//! Descriptor encoding
//!
//! The inverse of [`crate::parse`]: `parse(encode(d)) == d` for every
//! descriptor the parser can produce. Used by backends that only expose
//! already-parsed descriptors and by test fixtures.

use crate::constants::*;
use crate::types::*;

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl DeviceDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DEVICE_DESCRIPTOR_SIZE);
        out.push(DEVICE_DESCRIPTOR_SIZE as u8);
        out.push(DT_DEVICE);
        put_u16(&mut out, self.usb_version.0);
        out.push(self.class_code);
        out.push(self.sub_class_code);
        out.push(self.protocol_code);
        out.push(self.max_packet_size_0);
        put_u16(&mut out, self.vendor_id);
        put_u16(&mut out, self.product_id);
        put_u16(&mut out, self.device_version.0);
        out.push(self.manufacturer_string_index);
        out.push(self.product_string_index);
        out.push(self.serial_number_string_index);
        out.push(self.num_configurations);
        out
    }
}

impl ConfigDescriptor {
    /// Encoded size of the whole chain, the value written as wTotalLength
    pub fn encoded_len(&self) -> usize {
        CONFIG_DESCRIPTOR_SIZE
            + extra_len(&self.extra)
            + self
                .interfaces
                .iter()
                .flat_map(|i| i.alt_settings.iter())
                .map(InterfaceDescriptor::encoded_len)
                .sum::<usize>()
    }

    /// Encode the configuration header followed by its interface tree
    ///
    /// wTotalLength is recomputed from the contents, so a hand-built
    /// descriptor does not need to keep `total_length` in sync.
    pub fn encode(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let mut out = Vec::with_capacity(total);
        out.push(CONFIG_DESCRIPTOR_SIZE as u8);
        out.push(DT_CONFIG);
        put_u16(&mut out, total as u16);
        out.push(self.num_interfaces);
        out.push(self.configuration_value);
        out.push(self.configuration_string_index);
        out.push(self.attributes);
        out.push(self.max_power);
        encode_extra(&mut out, &self.extra);
        for interface in &self.interfaces {
            for alt in &interface.alt_settings {
                alt.encode_into(&mut out);
            }
        }
        out
    }
}

impl InterfaceDescriptor {
    pub fn encoded_len(&self) -> usize {
        INTERFACE_DESCRIPTOR_SIZE
            + extra_len(&self.extra)
            + self
                .endpoints
                .iter()
                .map(EndpointDescriptor::encoded_len)
                .sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(INTERFACE_DESCRIPTOR_SIZE as u8);
        out.push(DT_INTERFACE);
        out.push(self.interface_number);
        out.push(self.alternate_setting);
        out.push(self.num_endpoints);
        out.push(self.class_code);
        out.push(self.sub_class_code);
        out.push(self.protocol_code);
        out.push(self.interface_string_index);
        encode_extra(out, &self.extra);
        for endpoint in &self.endpoints {
            endpoint.encode_into(out);
        }
    }
}

impl EndpointDescriptor {
    fn header_len(&self) -> usize {
        if self.refresh.is_some() || self.synch_address.is_some() {
            ENDPOINT_AUDIO_DESCRIPTOR_SIZE
        } else {
            ENDPOINT_DESCRIPTOR_SIZE
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len()
            + self.ss_companion.map_or(0, |_| SS_ENDPOINT_COMPANION_SIZE)
            + extra_len(&self.extra)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let len = self.header_len();
        out.push(len as u8);
        out.push(DT_ENDPOINT);
        out.push(self.address);
        out.push(self.attributes);
        put_u16(out, self.raw_max_packet_size);
        out.push(self.interval);
        if len == ENDPOINT_AUDIO_DESCRIPTOR_SIZE {
            out.push(self.refresh.unwrap_or(0));
            out.push(self.synch_address.unwrap_or(0));
        }
        if let Some(companion) = self.ss_companion {
            out.push(SS_ENDPOINT_COMPANION_SIZE as u8);
            out.push(DT_SS_ENDPOINT_COMPANION);
            out.push(companion.max_burst);
            out.push(companion.attributes);
            put_u16(out, companion.bytes_per_interval);
        }
        encode_extra(out, &self.extra);
    }
}

/// Encode a string descriptor as UTF-16LE
///
/// Strings longer than a descriptor can hold (126 code units) are cut off.
pub fn encode_string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().take(126).collect();
    let mut out = Vec::with_capacity(2 + units.len() * 2);
    out.push((2 + units.len() * 2) as u8);
    out.push(DT_STRING);
    for unit in units {
        put_u16(&mut out, unit);
    }
    out
}

/// Encode string descriptor zero from a list of language IDs
pub fn encode_language_ids(ids: &[u16]) -> Vec<u8> {
    let ids = &ids[..ids.len().min(126)];
    let mut out = Vec::with_capacity(2 + ids.len() * 2);
    out.push((2 + ids.len() * 2) as u8);
    out.push(DT_STRING);
    for id in ids {
        put_u16(&mut out, *id);
    }
    out
}

fn extra_len(extra: &[UnknownDescriptor]) -> usize {
    extra.iter().map(|d| d.data.len()).sum()
}

fn encode_extra(out: &mut Vec<u8>, extra: &[UnknownDescriptor]) {
    for descriptor in extra {
        out.extend_from_slice(&descriptor.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_device_descriptor, parse_string_descriptor};

    #[test]
    fn test_device_descriptor_layout() {
        let desc = DeviceDescriptor {
            usb_version: BcdVersion(0x0200),
            class_code: 0xff,
            sub_class_code: 0x01,
            protocol_code: 0x02,
            max_packet_size_0: 64,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version: BcdVersion(0x0100),
            manufacturer_string_index: 1,
            product_string_index: 2,
            serial_number_string_index: 3,
            num_configurations: 1,
        };

        let bytes = desc.encode();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..4], &[0x12, 0x01, 0x00, 0x02]);
        assert_eq!(&bytes[8..12], &[0x34, 0x12, 0x78, 0x56]);

        let (parsed, next) = parse_device_descriptor(&bytes, 0).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(next, 18);
    }

    #[test]
    fn test_string_descriptor_non_ascii() {
        let bytes = encode_string_descriptor("Grüße ✓");
        let (text, _) = parse_string_descriptor(&bytes, 0).unwrap();
        assert_eq!(text, "Grüße ✓");
    }

    #[test]
    fn test_string_descriptor_truncates() {
        let long = "x".repeat(300);
        let bytes = encode_string_descriptor(&long);
        assert_eq!(bytes[0], 254);
        assert_eq!(bytes.len(), 254);
    }
}
