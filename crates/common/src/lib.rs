//! Common utilities for rust-usb-host
//!
//! This crate provides the ambient pieces shared by the host library and the
//! command-line tool: the infrastructure error type, logging setup, TOML
//! configuration (including VID:PID device filters), and descriptor fixtures
//! for tests.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use config::{DeviceFilter, EventLoopSettings, HostConfig, LoggingSettings, UsbSettings};
pub use error::{Error, Result};
pub use logging::{setup_logging, setup_logging_with};
