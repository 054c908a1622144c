//! Argument parsing helpers

use host::Device;
use std::fmt;
use std::str::FromStr;

/// Which device a command talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    VidPid { vendor_id: u16, product_id: u16 },
    /// Bus and port path in `DeviceKey` form, e.g. `1-2.3`
    Path(String),
}

impl DeviceSelector {
    pub fn matches(&self, device: &Device) -> bool {
        match self {
            DeviceSelector::VidPid {
                vendor_id,
                product_id,
            } => device.vendor_id() == *vendor_id && device.product_id() == *product_id,
            DeviceSelector::Path(path) => device.key().to_string() == *path,
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((vid, pid)) = s.split_once(':') {
            return Ok(DeviceSelector::VidPid {
                vendor_id: parse_u16(vid)?,
                product_id: parse_u16(pid)?,
            });
        }

        let valid_path = s.split_once('-').is_some_and(|(bus, ports)| {
            bus.parse::<u8>().is_ok() && ports.split('.').all(|p| p.parse::<u8>().is_ok())
        });
        if valid_path {
            Ok(DeviceSelector::Path(s.to_string()))
        } else {
            Err(format!(
                "'{}' is neither VID:PID (0x1234:0x5678) nor a bus-port path (1-2.3)",
                s
            ))
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::VidPid {
                vendor_id,
                product_id,
            } => write!(f, "{:04x}:{:04x}", vendor_id, product_id),
            DeviceSelector::Path(path) => f.write_str(path),
        }
    }
}

/// Hex payload; whitespace, `:` and a leading `0x` are ignored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let digits: Vec<char> = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':')
            .collect();
        if digits.len() % 2 != 0 {
            return Err(format!("odd number of hex digits in '{}'", s));
        }

        digits
            .chunks(2)
            .map(|pair| {
                let byte: String = pair.iter().collect();
                u8::from_str_radix(&byte, 16).map_err(|_| format!("'{}' is not a hex byte", byte))
            })
            .collect::<Result<Vec<u8>, String>>()
            .map(HexBytes)
    }
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("'{}' is not a number", s))
}

/// Decimal or `0x`-prefixed hex byte
pub fn parse_u8(s: &str) -> Result<u8, String> {
    u8::try_from(parse_number(s)?).map_err(|_| format!("{} does not fit in a byte", s))
}

/// Decimal or `0x`-prefixed hex word
pub fn parse_u16(s: &str) -> Result<u16, String> {
    u16::try_from(parse_number(s)?).map_err(|_| format!("{} does not fit in 16 bits", s))
}

/// Render bytes as space-separated hex, 16 per line
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            "0x1234:0x5678".parse::<DeviceSelector>(),
            Ok(DeviceSelector::VidPid {
                vendor_id: 0x1234,
                product_id: 0x5678
            })
        );
        assert_eq!(
            "1-2.3".parse::<DeviceSelector>(),
            Ok(DeviceSelector::Path("1-2.3".to_string()))
        );
        assert!("garbage".parse::<DeviceSelector>().is_err());
        assert!("1-x".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u8("0x81"), Ok(0x81));
        assert_eq!(parse_u8("129"), Ok(129));
        assert!(parse_u8("0x100").is_err());
        assert_eq!(parse_u16("0xFFFF"), Ok(0xffff));
        assert!(parse_u16("abc").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!("de ad:be ef".parse::<HexBytes>(), Ok(HexBytes(vec![0xde, 0xad, 0xbe, 0xef])));
        assert_eq!("0x0102".parse::<HexBytes>(), Ok(HexBytes(vec![1, 2])));
        assert_eq!("".parse::<HexBytes>(), Ok(HexBytes(Vec::new())));
        assert!("abc".parse::<HexBytes>().is_err());
        assert!("zz".parse::<HexBytes>().is_err());
    }

    #[test]
    fn test_hex_dump() {
        let bytes: Vec<u8> = (0..18).collect();
        let dump = hex_dump(&bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "10 11");
    }
}
