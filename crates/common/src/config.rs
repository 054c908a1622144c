//! Host configuration management
//!
//! Configuration is a TOML file with three sections:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [usb]
//! filters = ["0x04f9:*", "0x1234:0x5678"]
//! auto_detach_kernel_driver = true
//! default_timeout_ms = 1000
//! max_open_handles = 64
//!
//! [event_loop]
//! poll_interval_ms = 100
//! close_drain_timeout_ms = 2000
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub event_loop: EventLoopSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    /// Include the module target in each line
    #[serde(default)]
    pub show_target: bool,
    /// Include the thread name in each line
    #[serde(default = "LoggingSettings::default_thread_names")]
    pub thread_names: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            show_target: false,
            thread_names: Self::default_thread_names(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_thread_names() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID filters, empty means every device is enumerated
    #[serde(default)]
    pub filters: Vec<String>,
    /// Detach kernel drivers on claim and reattach on release (Linux only)
    #[serde(default = "UsbSettings::default_auto_detach")]
    pub auto_detach_kernel_driver: bool,
    /// Timeout used by tools when none is given (0 = wait indefinitely)
    #[serde(default = "UsbSettings::default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Maximum simultaneously open handles per context
    #[serde(default = "UsbSettings::default_max_open_handles")]
    pub max_open_handles: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            auto_detach_kernel_driver: Self::default_auto_detach(),
            default_timeout_ms: Self::default_timeout_ms(),
            max_open_handles: Self::default_max_open_handles(),
        }
    }
}

impl UsbSettings {
    fn default_auto_detach() -> bool {
        true
    }

    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_max_open_handles() -> usize {
        64
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Parse the configured filters
    pub fn parsed_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.filters.iter().map(|f| f.parse()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLoopSettings {
    /// Longest the event loop waits for completions when nothing is due
    #[serde(default = "EventLoopSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long closing a handle waits for its cancelled transfers to settle
    #[serde(default = "EventLoopSettings::default_close_drain_timeout_ms")]
    pub close_drain_timeout_ms: u64,
}

impl Default for EventLoopSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            close_drain_timeout_ms: Self::default_close_drain_timeout_ms(),
        }
    }
}

impl EventLoopSettings {
    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_close_drain_timeout_ms() -> u64 {
        2000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

impl HostConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists when `path` is `None`
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => [Self::default_path(), PathBuf::from("/etc/usbhost/config.toml")]
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("No configuration file found".to_string()))?,
        };

        let content = fs::read_to_string(&config_path)?;
        let config: HostConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbhost").join("config.toml")
        } else {
            PathBuf::from(".config/usbhost/config.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.as_str();
        // Full directives ("host=debug") are checked when the filter is built
        if !level.contains('=') && !valid_levels.contains(&level) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                level,
                valid_levels.join(", ")
            )));
        }

        self.usb.parsed_filters()?;

        if self.usb.max_open_handles == 0 {
            return Err(Error::Config(
                "max_open_handles must be greater than 0".to_string(),
            ));
        }
        if self.event_loop.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

/// One half of a VID:PID filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPattern {
    Any,
    Exact(u16),
}

impl IdPattern {
    fn matches(self, id: u16) -> bool {
        match self {
            IdPattern::Any => true,
            IdPattern::Exact(v) => v == id,
        }
    }

    fn parse(part: &str, name: &str, filter: &str) -> Result<Self> {
        if part == "*" {
            return Ok(IdPattern::Any);
        }

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Invalid {} '{}' in filter '{}', must start with '0x' (e.g., '0x1234')",
                    name, part, filter
                ))
            })?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(Error::Config(format!(
                "Invalid {} '{}' in filter '{}', hex part must be 1-4 digits",
                name, part, filter
            )));
        }

        u16::from_str_radix(hex, 16)
            .map(IdPattern::Exact)
            .map_err(|_| {
                Error::Config(format!(
                    "Invalid {} '{}' in filter '{}', not a valid hex number",
                    name, part, filter
                ))
            })
    }
}

/// Device filter in `VID:PID` form, either half may be `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor: IdPattern,
    pub product: IdPattern,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor.matches(vendor_id) && self.product.matches(product_id)
    }

    /// True when `filters` is empty or any filter matches
    pub fn allows(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }
}

impl FromStr for DeviceFilter {
    type Err = Error;

    fn from_str(filter: &str) -> Result<Self> {
        let (vid, pid) = filter.split_once(':').ok_or_else(|| {
            Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ))
        })?;

        Ok(Self {
            vendor: IdPattern::parse(vid, "VID", filter)?,
            product: IdPattern::parse(pid, "PID", filter)?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: IdPattern| match p {
            IdPattern::Any => "*".to_string(),
            IdPattern::Exact(v) => format!("{:#06x}", v),
        };
        write!(f, "{}:{}", part(self.vendor), part(self.product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.usb.filters.is_empty());
        assert!(config.usb.auto_detach_kernel_driver);
        assert_eq!(config.event_loop.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_filter_logic() {
        let filters: Vec<DeviceFilter> = ["0x1234:0x5678", "0xABCD:*"]
            .iter()
            .map(|f| f.parse().unwrap())
            .collect();

        assert!(DeviceFilter::allows(&filters, 0x1234, 0x5678));
        assert!(DeviceFilter::allows(&filters, 0xABCD, 0x1111));
        assert!(DeviceFilter::allows(&filters, 0xABCD, 0x9999));

        assert!(!DeviceFilter::allows(&filters, 0x1234, 0x9999));
        assert!(!DeviceFilter::allows(&filters, 0x9999, 0x5678));

        assert!(DeviceFilter::allows(&[], 0x1234, 0x5678));
    }

    #[test]
    fn test_filter_invalid() {
        for bad in ["1234:5678", "0x1234", "0x12345:*", "0xZZZZ:*", "0x:*"] {
            assert!(bad.parse::<DeviceFilter>().is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_filter_display() {
        let filter: DeviceFilter = "0x4f9:*".parse().unwrap();
        assert_eq!(filter.to_string(), "0x04f9:*");
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "host=trace".to_string();
        assert!(config.validate().is_ok());
    }
}
