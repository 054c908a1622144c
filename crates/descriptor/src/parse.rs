//! Descriptor parsing
//!
//! Every parser takes the raw buffer and an offset and returns the typed
//! descriptor together with the offset just past it. Parsers never panic on
//! malformed input; anything inconsistent surfaces as a [`DescriptorError`].

use crate::constants::*;
use crate::error::{DescriptorError, Result};
use crate::types::*;
use byteorder::{ByteOrder, LittleEndian};

/// The two bytes every descriptor starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeader {
    pub length: u8,
    pub descriptor_type: u8,
}

/// Read the header at `offset` and check that the declared length fits
pub fn parse_header(buf: &[u8], offset: usize) -> Result<DescriptorHeader> {
    let available = buf.len().saturating_sub(offset);
    if available < 2 {
        return Err(DescriptorError::Truncated {
            offset,
            declared: 2,
            available,
        });
    }

    let header = DescriptorHeader {
        length: buf[offset],
        descriptor_type: buf[offset + 1],
    };

    if (header.length as usize) < 2 {
        return Err(DescriptorError::TooShort {
            offset,
            length: header.length as usize,
            minimum: 2,
        });
    }
    if header.length as usize > available {
        return Err(DescriptorError::Truncated {
            offset,
            declared: header.length as usize,
            available,
        });
    }

    Ok(header)
}

/// Header check for descriptors with a fixed type tag and minimum size
fn expect_header(
    buf: &[u8],
    offset: usize,
    expected: u8,
    minimum: usize,
) -> Result<DescriptorHeader> {
    let header = parse_header(buf, offset)?;
    if header.descriptor_type != expected {
        return Err(DescriptorError::UnexpectedType {
            offset,
            expected,
            found: header.descriptor_type,
        });
    }
    if (header.length as usize) < minimum {
        return Err(DescriptorError::TooShort {
            offset,
            length: header.length as usize,
            minimum,
        });
    }
    Ok(header)
}

/// Parse an 18-byte device descriptor
pub fn parse_device_descriptor(buf: &[u8], offset: usize) -> Result<(DeviceDescriptor, usize)> {
    let header = expect_header(buf, offset, DT_DEVICE, DEVICE_DESCRIPTOR_SIZE)?;
    let d = &buf[offset..];

    let descriptor = DeviceDescriptor {
        usb_version: BcdVersion(LittleEndian::read_u16(&d[2..4])),
        class_code: d[4],
        sub_class_code: d[5],
        protocol_code: d[6],
        max_packet_size_0: d[7],
        vendor_id: LittleEndian::read_u16(&d[8..10]),
        product_id: LittleEndian::read_u16(&d[10..12]),
        device_version: BcdVersion(LittleEndian::read_u16(&d[12..14])),
        manufacturer_string_index: d[14],
        product_string_index: d[15],
        serial_number_string_index: d[16],
        num_configurations: d[17],
    };

    Ok((descriptor, offset + header.length as usize))
}

/// Parse a standalone interface descriptor (no endpoints attached)
pub fn parse_interface_descriptor(
    buf: &[u8],
    offset: usize,
) -> Result<(InterfaceDescriptor, usize)> {
    let header = expect_header(buf, offset, DT_INTERFACE, INTERFACE_DESCRIPTOR_SIZE)?;
    let d = &buf[offset..];

    let descriptor = InterfaceDescriptor {
        interface_number: d[2],
        alternate_setting: d[3],
        num_endpoints: d[4],
        class_code: d[5],
        sub_class_code: d[6],
        protocol_code: d[7],
        interface_string_index: d[8],
        endpoints: Vec::new(),
        extra: Vec::new(),
    };

    Ok((descriptor, offset + header.length as usize))
}

/// Parse a standalone endpoint descriptor (7 or 9 bytes)
pub fn parse_endpoint_descriptor(buf: &[u8], offset: usize) -> Result<(EndpointDescriptor, usize)> {
    let header = expect_header(buf, offset, DT_ENDPOINT, ENDPOINT_DESCRIPTOR_SIZE)?;
    let d = &buf[offset..];
    let audio = header.length as usize >= ENDPOINT_AUDIO_DESCRIPTOR_SIZE;

    let descriptor = EndpointDescriptor {
        address: d[2],
        attributes: d[3],
        raw_max_packet_size: LittleEndian::read_u16(&d[4..6]),
        interval: d[6],
        refresh: audio.then(|| d[7]),
        synch_address: audio.then(|| d[8]),
        ss_companion: None,
        extra: Vec::new(),
    };

    Ok((descriptor, offset + header.length as usize))
}

/// Parse a SuperSpeed endpoint companion descriptor
pub fn parse_ss_endpoint_companion(
    buf: &[u8],
    offset: usize,
) -> Result<(SuperSpeedEndpointCompanion, usize)> {
    let header = expect_header(
        buf,
        offset,
        DT_SS_ENDPOINT_COMPANION,
        SS_ENDPOINT_COMPANION_SIZE,
    )?;
    let d = &buf[offset..];

    let companion = SuperSpeedEndpointCompanion {
        max_burst: d[2],
        attributes: d[3],
        bytes_per_interval: LittleEndian::read_u16(&d[4..6]),
    };

    Ok((companion, offset + header.length as usize))
}

/// Where descriptors of unknown type get attached while walking a configuration
#[derive(Clone, Copy)]
enum Owner {
    Config,
    Interface { interface: usize, alt: usize },
    Endpoint { interface: usize, alt: usize, endpoint: usize },
}

/// Parse a configuration descriptor and the full chain `wTotalLength` covers
///
/// Interface descriptors are grouped by interface number, endpoints attach
/// to the interface descriptor preceding them. Descriptors of any other type
/// are kept as [`UnknownDescriptor`]s on the nearest preceding owner.
pub fn parse_config_descriptor(buf: &[u8], offset: usize) -> Result<(ConfigDescriptor, usize)> {
    let header = expect_header(buf, offset, DT_CONFIG, CONFIG_DESCRIPTOR_SIZE)?;
    let d = &buf[offset..];
    let total_length = LittleEndian::read_u16(&d[2..4]);

    if (total_length as usize) < header.length as usize {
        return Err(DescriptorError::TooShort {
            offset,
            length: total_length as usize,
            minimum: header.length as usize,
        });
    }
    let available = buf.len() - offset;
    if total_length as usize > available {
        return Err(DescriptorError::Truncated {
            offset,
            declared: total_length as usize,
            available,
        });
    }

    let mut config = ConfigDescriptor {
        total_length,
        num_interfaces: d[4],
        configuration_value: d[5],
        configuration_string_index: d[6],
        attributes: d[7],
        max_power: d[8],
        interfaces: Vec::new(),
        extra: Vec::new(),
    };

    let end = offset + total_length as usize;
    // Bound the chain so nothing past wTotalLength is ever read
    let chain = &buf[..end];
    let mut pos = offset + header.length as usize;
    let mut owner = Owner::Config;

    while pos < end {
        let next = parse_header(chain, pos)?;
        let next_end = pos + next.length as usize;

        match next.descriptor_type {
            DT_INTERFACE if next.length as usize >= INTERFACE_DESCRIPTOR_SIZE => {
                let (alt, _) = parse_interface_descriptor(chain, pos)?;
                let interface = match config
                    .interfaces
                    .iter()
                    .position(|i| i.number == alt.interface_number)
                {
                    Some(index) => index,
                    None => {
                        config.interfaces.push(Interface {
                            number: alt.interface_number,
                            alt_settings: Vec::new(),
                        });
                        config.interfaces.len() - 1
                    }
                };
                let alts = &mut config.interfaces[interface].alt_settings;
                alts.push(alt);
                owner = Owner::Interface {
                    interface,
                    alt: alts.len() - 1,
                };
            }
            DT_ENDPOINT if next.length as usize >= ENDPOINT_DESCRIPTOR_SIZE => {
                match owner {
                    Owner::Interface { interface, alt } | Owner::Endpoint { interface, alt, .. } => {
                        let (endpoint, _) = parse_endpoint_descriptor(chain, pos)?;
                        let endpoints =
                            &mut config.interfaces[interface].alt_settings[alt].endpoints;
                        endpoints.push(endpoint);
                        owner = Owner::Endpoint {
                            interface,
                            alt,
                            endpoint: endpoints.len() - 1,
                        };
                    }
                    // An endpoint outside any interface cannot be used; keep it opaque
                    Owner::Config => config.extra.push(unknown(chain, pos, next)),
                }
            }
            DT_SS_ENDPOINT_COMPANION
                if next.length as usize >= SS_ENDPOINT_COMPANION_SIZE
                    && companion_slot_free(&config, owner) =>
            {
                let (companion, _) = parse_ss_endpoint_companion(chain, pos)?;
                if let Owner::Endpoint {
                    interface,
                    alt,
                    endpoint,
                } = owner
                {
                    config.interfaces[interface].alt_settings[alt].endpoints[endpoint]
                        .ss_companion = Some(companion);
                }
            }
            _ => {
                let descriptor = unknown(chain, pos, next);
                match owner {
                    Owner::Config => config.extra.push(descriptor),
                    Owner::Interface { interface, alt } => config.interfaces[interface]
                        .alt_settings[alt]
                        .extra
                        .push(descriptor),
                    Owner::Endpoint {
                        interface,
                        alt,
                        endpoint,
                    } => config.interfaces[interface].alt_settings[alt].endpoints[endpoint]
                        .extra
                        .push(descriptor),
                }
            }
        }

        pos = next_end;
    }

    Ok((config, end))
}

fn companion_slot_free(config: &ConfigDescriptor, owner: Owner) -> bool {
    match owner {
        Owner::Endpoint {
            interface,
            alt,
            endpoint,
        } => config.interfaces[interface].alt_settings[alt].endpoints[endpoint]
            .ss_companion
            .is_none(),
        _ => false,
    }
}

fn unknown(buf: &[u8], pos: usize, header: DescriptorHeader) -> UnknownDescriptor {
    UnknownDescriptor {
        descriptor_type: header.descriptor_type,
        data: buf[pos..pos + header.length as usize].to_vec(),
    }
}

/// Parse a string descriptor (UTF-16LE payload)
///
/// Unpaired surrogates are replaced with U+FFFD; an odd trailing byte is
/// ignored.
pub fn parse_string_descriptor(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let header = expect_header(buf, offset, DT_STRING, 2)?;
    let payload = &buf[offset + 2..offset + header.length as usize];

    let units = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let text = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();

    Ok((text, offset + header.length as usize))
}

/// Parse string descriptor zero, the list of supported language IDs
pub fn parse_language_ids(buf: &[u8], offset: usize) -> Result<(Vec<u16>, usize)> {
    let header = expect_header(buf, offset, DT_STRING, 2)?;
    let payload = &buf[offset + 2..offset + header.length as usize];

    let ids = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Ok((ids, offset + header.length as usize))
}
