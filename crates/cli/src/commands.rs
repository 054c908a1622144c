//! Subcommand implementations

use crate::selector::{DeviceSelector, hex_dump, parse_u8};
use anyhow::{Context as _, Result, anyhow, bail};
use clap::Args;
use descriptor::{ConfigDescriptor, DeviceDescriptor, SetupPacket, TransferType};
use host::{CompletedTransfer, Context, Device, DeviceHandle, Speed, Transfer};
use serde::Serialize;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

/// Where a bulk or interrupt transfer goes
#[derive(Args, Debug, Clone)]
pub struct EndpointTarget {
    /// Endpoint address, e.g. 0x81
    #[arg(long, value_parser = parse_u8)]
    pub endpoint: u8,

    /// Configuration to select when the device is unconfigured
    #[arg(long, default_value_t = 1)]
    pub configuration: u8,
}

#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub data: Option<Vec<u8>>,
}

pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T, F>(&self, value: &T, human: F) -> Result<()>
    where
        T: Serialize,
        F: FnOnce(&T),
    {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct DeviceSummary {
    key: String,
    bus_number: u8,
    port_path: Vec<u8>,
    address: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<Speed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceDetails<'a> {
    key: String,
    speed: Speed,
    descriptor: &'a DeviceDescriptor,
    configurations: &'a [ConfigDescriptor],
}

#[derive(Debug, Serialize)]
struct TransferReport {
    endpoint: u8,
    actual_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
}

impl TransferReport {
    fn new(completed: &CompletedTransfer, include_data: bool) -> Self {
        Self {
            endpoint: completed.endpoint,
            actual_length: completed.actual_length,
            data: include_data.then(|| completed.data().to_vec()),
        }
    }

    fn print(&self) {
        match &self.data {
            Some(data) if data.is_empty() => println!("Received 0 bytes"),
            Some(data) => println!("Received {} bytes:\n{}", data.len(), hex_dump(data)),
            None => println!("Sent {} bytes", self.actual_length),
        }
    }
}

pub fn list(context: &Context, strings: bool, timeout: Duration, output: &Output) -> Result<()> {
    let devices = context.enumerate().context("Failed to enumerate devices")?;

    let summaries: Vec<DeviceSummary> = devices
        .into_iter()
        .map(|entry| match entry {
            Ok(device) => {
                let (manufacturer, product) = if strings {
                    read_strings(context, &device, timeout)
                } else {
                    (None, None)
                };
                DeviceSummary {
                    key: device.key().to_string(),
                    bus_number: device.bus_number(),
                    port_path: device.port_path().to_vec(),
                    address: device.address(),
                    vendor_id: Some(device.vendor_id()),
                    product_id: Some(device.product_id()),
                    speed: Some(device.speed()),
                    manufacturer,
                    product,
                    error: None,
                }
            }
            Err(e) => DeviceSummary {
                key: e.key.to_string(),
                bus_number: e.key.bus_number,
                port_path: e.key.port_path.clone(),
                address: e.address,
                vendor_id: None,
                product_id: None,
                speed: None,
                manufacturer: None,
                product: None,
                error: Some(e.error.to_string()),
            },
        })
        .collect();

    output.emit(&summaries, |summaries| {
        if summaries.is_empty() {
            println!("No USB devices found.");
            return;
        }
        for s in summaries {
            match (s.vendor_id, s.product_id, &s.error) {
                (Some(vid), Some(pid), _) => println!(
                    "Bus {:03} Device {:03} Port {}: ID {:04x}:{:04x} {} {} ({})",
                    s.bus_number,
                    s.address,
                    s.key,
                    vid,
                    pid,
                    s.manufacturer.as_deref().unwrap_or(""),
                    s.product.as_deref().unwrap_or(""),
                    s.speed.map(|sp| sp.to_string()).unwrap_or_default()
                ),
                (_, _, error) => println!(
                    "Bus {:03} Device {:03} Port {}: unreadable ({})",
                    s.bus_number,
                    s.address,
                    s.key,
                    error.as_deref().unwrap_or("unknown error")
                ),
            }
        }
    })
}

/// Manufacturer and product strings; devices we cannot open get neither
fn read_strings(context: &Context, device: &Device, timeout: Duration) -> (Option<String>, Option<String>) {
    let handle = match context.open(device) {
        Ok(handle) => handle,
        Err(e) => {
            debug!("Cannot open {} for strings: {}", device, e);
            return (None, None);
        }
    };

    let read = |index: Option<u8>| {
        index.and_then(|i| match handle.read_string_descriptor_ascii(i, timeout) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("String {} of {} unreadable: {}", i, device, e);
                None
            }
        })
    };

    let descriptor = device.descriptor();
    (
        read(descriptor.manufacturer_string()),
        read(descriptor.product_string()),
    )
}

pub fn show(context: &Context, selector: &DeviceSelector, output: &Output) -> Result<()> {
    let device = find_device(context, selector)?;
    let details = DeviceDetails {
        key: device.key().to_string(),
        speed: device.speed(),
        descriptor: device.descriptor(),
        configurations: device.configurations(),
    };

    output.emit(&details, |details| {
        let d = details.descriptor;
        println!("Device {} ({})", details.key, details.speed);
        println!("  bcdUSB             {}", d.usb_version);
        println!(
            "  bDeviceClass       {:#04x}/{:#04x}/{:#04x}",
            d.class_code, d.sub_class_code, d.protocol_code
        );
        println!("  bMaxPacketSize0    {}", d.max_packet_size_0);
        println!("  idVendor           {:#06x}", d.vendor_id);
        println!("  idProduct          {:#06x}", d.product_id);
        println!("  bcdDevice          {}", d.device_version);
        println!("  bNumConfigurations {}", d.num_configurations);

        for config in details.configurations {
            println!(
                "  Configuration {}: {} interfaces, {} mA{}",
                config.configuration_value,
                config.num_interfaces,
                config.max_power_ma(details.speed.is_super_speed()),
                if config.self_powered() { ", self powered" } else { "" }
            );
            for interface in &config.interfaces {
                for alt in &interface.alt_settings {
                    println!(
                        "    Interface {} alt {}: class {:#04x}/{:#04x}/{:#04x}",
                        alt.interface_number,
                        alt.alternate_setting,
                        alt.class_code,
                        alt.sub_class_code,
                        alt.protocol_code
                    );
                    for endpoint in &alt.endpoints {
                        println!(
                            "      Endpoint {:#04x} {:?} {}, max packet {}, interval {}",
                            endpoint.address,
                            endpoint.direction(),
                            endpoint.transfer_type(),
                            endpoint.max_packet_size(),
                            endpoint.interval
                        );
                    }
                }
            }
        }
    })
}

pub async fn control(
    context: &Context,
    selector: &DeviceSelector,
    request: ControlRequest,
    timeout: Duration,
    output: &Output,
) -> Result<()> {
    let device = find_device(context, selector)?;
    let handle = context.open(&device).context("Failed to open device")?;

    let is_in = request.request_type & 0x80 != 0;
    let buffer = match (is_in, request.data) {
        (true, Some(_)) => bail!("--data is only valid for OUT requests (bit 7 of bmRequestType clear)"),
        (true, None) => vec![0; usize::from(request.length)],
        (false, data) => data.unwrap_or_default(),
    };
    let length = u16::try_from(buffer.len()).context("Control payload too long")?;

    let setup = SetupPacket {
        request_type: request.request_type,
        request: request.request,
        value: request.value,
        index: request.index,
        length,
    };
    let completed = run_transfer(&handle, Transfer::control(setup, buffer, timeout)).await?;

    let report = TransferReport::new(&completed, is_in);
    output.emit(&report, TransferReport::print)
}

pub async fn read(
    context: &Context,
    selector: &DeviceSelector,
    target: &EndpointTarget,
    length: usize,
    timeout: Duration,
    output: &Output,
) -> Result<()> {
    if target.endpoint & 0x80 == 0 {
        bail!("Endpoint {:#04x} is an OUT endpoint", target.endpoint);
    }
    let device = find_device(context, selector)?;
    let (handle, transfer_type) = prepare_endpoint(context, &device, target)?;

    let transfer = data_transfer(transfer_type, target.endpoint, vec![0; length], timeout)?;
    let completed = run_transfer(&handle, transfer).await?;

    let report = TransferReport::new(&completed, true);
    output.emit(&report, TransferReport::print)
}

pub async fn write(
    context: &Context,
    selector: &DeviceSelector,
    target: &EndpointTarget,
    data: Vec<u8>,
    timeout: Duration,
    output: &Output,
) -> Result<()> {
    if target.endpoint & 0x80 != 0 {
        bail!("Endpoint {:#04x} is an IN endpoint", target.endpoint);
    }
    let device = find_device(context, selector)?;
    let (handle, transfer_type) = prepare_endpoint(context, &device, target)?;

    let transfer = data_transfer(transfer_type, target.endpoint, data, timeout)?;
    let completed = run_transfer(&handle, transfer).await?;

    let report = TransferReport::new(&completed, false);
    output.emit(&report, TransferReport::print)
}

fn find_device(context: &Context, selector: &DeviceSelector) -> Result<Device> {
    let devices = context.enumerate().context("Failed to enumerate devices")?;
    let mut matches = devices.devices().filter(|d| selector.matches(d));

    let device = matches
        .next()
        .cloned()
        .ok_or_else(|| anyhow!("No device matches {}", selector))?;
    if matches.next().is_some() {
        warn!("Several devices match {}, using {}", selector, device.key());
    }
    Ok(device)
}

/// Open the device, make sure a configuration is active and claim the
/// interface that owns the endpoint
fn prepare_endpoint(
    context: &Context,
    device: &Device,
    target: &EndpointTarget,
) -> Result<(DeviceHandle, TransferType)> {
    let handle = context.open(device).context("Failed to open device")?;

    let value = match handle.active_configuration()? {
        Some(value) => value,
        None => {
            info!("Selecting configuration {}", target.configuration);
            handle
                .set_configuration(target.configuration)
                .context("Failed to set configuration")?;
            target.configuration
        }
    };

    let config = device
        .configuration(value)
        .ok_or_else(|| anyhow!("Device has no configuration {}", value))?;
    let (interface, alternate_setting, transfer_type) = locate_endpoint(config, target.endpoint)
        .ok_or_else(|| {
            anyhow!(
                "Configuration {} has no endpoint {:#04x}",
                value,
                target.endpoint
            )
        })?;

    handle
        .claim_interface(interface)
        .with_context(|| format!("Failed to claim interface {}", interface))?;
    if alternate_setting != 0 {
        handle
            .set_alternate_setting(interface, alternate_setting)
            .with_context(|| format!("Failed to select alternate setting {}", alternate_setting))?;
    }

    Ok((handle, transfer_type))
}

/// Interface, alternate setting and transfer type carrying `endpoint`
fn locate_endpoint(config: &ConfigDescriptor, endpoint: u8) -> Option<(u8, u8, TransferType)> {
    config
        .interfaces
        .iter()
        .flat_map(|interface| &interface.alt_settings)
        .find_map(|alt| {
            alt.endpoints
                .iter()
                .find(|e| e.address == endpoint)
                .map(|e| (alt.interface_number, alt.alternate_setting, e.transfer_type()))
        })
}

fn data_transfer(transfer_type: TransferType, endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> Result<Transfer> {
    match transfer_type {
        TransferType::Bulk => Ok(Transfer::bulk(endpoint, buffer, timeout)),
        TransferType::Interrupt => Ok(Transfer::interrupt(endpoint, buffer, timeout)),
        other => bail!("Endpoint {:#04x} is {}, only bulk and interrupt are supported", endpoint, other),
    }
}

/// Submit and wait; Ctrl-C cancels the transfer
async fn run_transfer(handle: &DeviceHandle, transfer: Transfer) -> Result<CompletedTransfer> {
    let mut future = handle.submit_transfer_async(transfer)?;
    let id = future.id();

    let completed = tokio::select! {
        result = &mut future => result?,
        _ = signal::ctrl_c() => {
            info!("Interrupted, cancelling {}", id);
            handle.cancel_transfer(id);
            future.await?
        }
    };

    Ok(completed.into_result()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        BULK_IN_EP, BULK_OUT_EP, INTERRUPT_IN_EP, ISO_IN_EP, create_iso_config_descriptor,
        create_mock_device_descriptor,
    };
    use host::ContextOptions;
    use host::backend::mock::{MockBackend, MockDevice, MockResponse};
    use std::sync::Arc;

    fn mock_context() -> (Arc<MockBackend>, Context) {
        let mock = Arc::new(MockBackend::new());
        mock.add_device(MockDevice::new(
            1,
            vec![3],
            7,
            create_mock_device_descriptor(0x1234, 0x5678),
            vec![create_iso_config_descriptor(1)],
        ));
        let options = ContextOptions {
            poll_interval: Duration::from_millis(10),
            ..ContextOptions::default()
        };
        let context = Context::new(mock.clone(), options).unwrap();
        (mock, context)
    }

    #[test]
    fn test_locate_endpoint() {
        let (_, context) = mock_context();
        let device = find_device(&context, &"1-3".parse().unwrap()).unwrap();
        let config = device.configuration(1).unwrap();

        assert_eq!(
            locate_endpoint(config, BULK_IN_EP),
            Some((0, 0, TransferType::Bulk))
        );
        assert_eq!(
            locate_endpoint(config, INTERRUPT_IN_EP),
            Some((0, 0, TransferType::Interrupt))
        );
        assert_eq!(
            locate_endpoint(config, ISO_IN_EP),
            Some((1, 1, TransferType::Isochronous))
        );
        assert_eq!(locate_endpoint(config, 0x8f), None);
    }

    #[test]
    fn test_find_device_by_vid_pid() {
        let (_, context) = mock_context();
        let device = find_device(&context, &"0x1234:0x5678".parse().unwrap()).unwrap();
        assert_eq!(device.address(), 7);
        assert!(find_device(&context, &"0x1234:0x0001".parse().unwrap()).is_err());
    }

    #[test]
    fn test_iso_endpoint_rejected() {
        assert!(data_transfer(TransferType::Isochronous, ISO_IN_EP, Vec::new(), Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_prepare_and_read() {
        let (mock, context) = mock_context();
        let device = find_device(&context, &"1-3".parse().unwrap()).unwrap();
        let target = EndpointTarget {
            endpoint: BULK_IN_EP,
            configuration: 1,
        };

        let (handle, transfer_type) = prepare_endpoint(&context, &device, &target).unwrap();
        assert_eq!(transfer_type, TransferType::Bulk);
        assert_eq!(handle.active_configuration().unwrap(), Some(1));
        assert_eq!(handle.claimed_interfaces().unwrap(), vec![0]);

        mock.respond(BULK_IN_EP, MockResponse::Data(vec![1, 2, 3]));
        let transfer = data_transfer(transfer_type, BULK_IN_EP, vec![0; 8], Duration::from_secs(1)).unwrap();
        let completed = run_transfer(&handle, transfer).await.unwrap();
        assert_eq!(completed.data(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_write_reports_stall() {
        let (mock, context) = mock_context();
        let selector: DeviceSelector = "1-3".parse().unwrap();
        let target = EndpointTarget {
            endpoint: BULK_OUT_EP,
            configuration: 1,
        };
        mock.respond(BULK_OUT_EP, MockResponse::Stall);

        let output = Output { json: true };
        let err = write(&context, &selector, &target, vec![1, 2], Duration::from_secs(1), &output)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<host::UsbError>(),
            Some(&host::UsbError::TransferStalled)
        );
    }
}
