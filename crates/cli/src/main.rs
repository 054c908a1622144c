//! usbhost
//!
//! Command-line front end for the host library: list devices, dump their
//! descriptors and run one-off control, bulk and interrupt transfers.

mod commands;
mod selector;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use common::{HostConfig, setup_logging_with};
use host::{Context, ContextOptions};
use selector::{DeviceSelector, HexBytes, parse_u8, parse_u16};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "usbhost")]
#[command(author, version, about = "Inspect and talk to USB devices")]
#[command(long_about = "
Enumerate USB devices through libusb, dump their descriptors and run single
transfers against them.

EXAMPLES:
    # List every device on the bus
    usbhost list

    # Descriptors of a device, by VID:PID or by bus-port path
    usbhost show 0x1234:0x5678
    usbhost show 1-2.3 --json

    # Vendor control request reading 4 bytes
    usbhost control 0x1234:0x5678 --request-type 0xc0 --request 0x01 --length 4

    # Read 64 bytes from bulk IN endpoint 0x81 on interface 0
    usbhost read 0x1234:0x5678 --endpoint 0x81 --length 64

    # Write to bulk OUT endpoint 0x02
    usbhost write 0x1234:0x5678 --endpoint 0x02 --data 'de ad be ef'

CONFIGURATION:
    Settings are read from, in order:
    1. Path specified with --config
    2. ~/.config/usbhost/config.toml
    3. /etc/usbhost/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Transfer timeout in milliseconds, 0 waits indefinitely
    #[arg(short, long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices on the bus
    List {
        /// Also read manufacturer and product strings (opens each device)
        #[arg(long)]
        strings: bool,
    },

    /// Show the descriptors of one device
    Show {
        /// VID:PID (0x1234:0x5678) or bus-port path (1-2.3)
        device: DeviceSelector,
    },

    /// Run a control transfer on endpoint 0
    Control {
        device: DeviceSelector,
        /// bmRequestType; bit 7 set reads from the device
        #[arg(long, value_parser = parse_u8)]
        request_type: u8,
        /// bRequest
        #[arg(long, value_parser = parse_u8)]
        request: u8,
        /// wValue
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        value: u16,
        /// wIndex
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        index: u16,
        /// Bytes to read for IN requests
        #[arg(long, default_value_t = 0)]
        length: u16,
        /// Hex payload for OUT requests
        #[arg(long)]
        data: Option<HexBytes>,
    },

    /// Read from a bulk or interrupt IN endpoint
    Read {
        device: DeviceSelector,
        #[command(flatten)]
        target: commands::EndpointTarget,
        /// Bytes to request
        #[arg(long, default_value_t = 64)]
        length: usize,
    },

    /// Write to a bulk or interrupt OUT endpoint
    Write {
        device: DeviceSelector,
        #[command(flatten)]
        target: commands::EndpointTarget,
        /// Hex payload
        #[arg(long)]
        data: HexBytes,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HostConfig::load(Some(path.clone())).context("Failed to load configuration")?,
        None => HostConfig::load_or_default(),
    };

    let mut logging = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    setup_logging_with(&logging).context("Failed to setup logging")?;
    debug!("usbhost v{}", env!("CARGO_PKG_VERSION"));

    let options = ContextOptions::from_config(&config).context("Invalid device filters")?;
    let context = Context::with_libusb(options).context("Failed to open the USB host controller")?;
    info!("Using {} backend", context.backend_name());

    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.usb.default_timeout());
    let output = commands::Output { json: args.json };

    let result = match args.command {
        Command::List { strings } => commands::list(&context, strings, timeout, &output),
        Command::Show { device } => commands::show(&context, &device, &output),
        Command::Control {
            device,
            request_type,
            request,
            value,
            index,
            length,
            data,
        } => {
            let request = commands::ControlRequest {
                request_type,
                request,
                value,
                index,
                length,
                data: data.map(|d| d.0),
            };
            commands::control(&context, &device, request, timeout, &output).await
        }
        Command::Read {
            device,
            target,
            length,
        } => commands::read(&context, &device, &target, length, timeout, &output).await,
        Command::Write {
            device,
            target,
            data,
        } => commands::write(&context, &device, &target, data.0, timeout, &output).await,
    };

    context.shutdown();
    result
}
