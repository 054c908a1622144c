//! Device enumeration
//!
//! Each call to [`Registry::enumerate`] takes a fresh snapshot of the bus.
//! The registry remembers which attachment it last saw at every
//! [`DeviceKey`] so snapshots of one attachment share a liveness flag, and
//! attachments that vanished are marked gone.

use crate::backend::{HostBackend, RawDevice};
use crate::device::{Device, DeviceKey, Liveness};
use crate::error::{Result, UsbError};
use common::DeviceFilter;
use descriptor::{parse_config_descriptor, parse_device_descriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A device whose descriptors could not be read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to read descriptors of device {key}: {error}")]
pub struct EnumerationError {
    pub key: DeviceKey,
    pub address: u8,
    pub error: UsbError,
}

/// Result of one enumeration
///
/// Per-device failures are kept as entries so one broken device does not
/// hide the rest of the bus. Iterating consumes the list.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    entries: Vec<std::result::Result<Device, EnumerationError>>,
}

impl DeviceList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Successfully enumerated devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.iter().filter_map(|e| e.as_ref().ok())
    }

    pub fn errors(&self) -> impl Iterator<Item = &EnumerationError> {
        self.entries.iter().filter_map(|e| e.as_ref().err())
    }

    pub fn find(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices().find(|d| d.key() == key)
    }

    pub fn by_vid_pid(&self, vendor_id: u16, product_id: u16) -> impl Iterator<Item = &Device> {
        self.devices()
            .filter(move |d| d.vendor_id() == vendor_id && d.product_id() == product_id)
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.entries.into_iter().filter_map(|e| e.ok()).collect()
    }
}

impl IntoIterator for DeviceList {
    type Item = std::result::Result<Device, EnumerationError>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Attachment last seen at a key
struct Attachment {
    address: u8,
    liveness: Arc<Liveness>,
}

pub(crate) struct Registry {
    backend: Arc<dyn HostBackend>,
    filters: Vec<DeviceFilter>,
    attachments: Mutex<HashMap<DeviceKey, Attachment>>,
}

impl Registry {
    pub(crate) fn new(backend: Arc<dyn HostBackend>, filters: Vec<DeviceFilter>) -> Self {
        Self {
            backend,
            filters,
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn enumerate(&self) -> Result<DeviceList> {
        let raw_devices = self.backend.list_devices().map_err(|e| {
            UsbError::HostControllerUnavailable(format!("failed to list devices: {}", e))
        })?;

        let mut attachments = self
            .attachments
            .lock()
            .map_err(|_| UsbError::InternalHostError("registry lock poisoned".to_string()))?;

        let mut seen = HashMap::with_capacity(raw_devices.len());
        let mut entries = Vec::with_capacity(raw_devices.len());

        for raw in raw_devices {
            let key = DeviceKey::new(raw.bus_number, raw.port_path.clone());

            let liveness = match attachments.remove(&key) {
                Some(previous) if previous.address == raw.address && !previous.liveness.is_gone() => {
                    previous.liveness
                }
                Some(previous) => {
                    // Same port, new attachment: the old snapshots are stale
                    previous.liveness.mark_gone();
                    Arc::new(Liveness::default())
                }
                None => Arc::new(Liveness::default()),
            };

            match self.read_device(&raw, key.clone(), liveness.clone()) {
                Ok(Some(device)) => entries.push(Ok(device)),
                Ok(None) => {}
                Err(error) => {
                    warn!("Failed to read descriptors of device {}: {}", key, error);
                    entries.push(Err(EnumerationError {
                        key: key.clone(),
                        address: raw.address,
                        error,
                    }));
                }
            }

            seen.insert(
                key,
                Attachment {
                    address: raw.address,
                    liveness,
                },
            );
        }

        for (key, vanished) in attachments.drain() {
            debug!("Device {} no longer on the bus", key);
            vanished.liveness.mark_gone();
        }
        *attachments = seen;

        info!("Enumerated {} devices", entries.len());
        Ok(DeviceList { entries })
    }

    /// Read and parse all descriptors of one device, `None` when filtered out
    fn read_device(&self, raw: &RawDevice, key: DeviceKey, liveness: Arc<Liveness>) -> Result<Option<Device>> {
        let bytes = self.backend.device_descriptor(raw.id)?;
        let (descriptor, _) = parse_device_descriptor(&bytes, 0)?;

        if !DeviceFilter::allows(&self.filters, descriptor.vendor_id, descriptor.product_id) {
            debug!(
                "Device ignored by filter: {}, vid={:#06x}, pid={:#06x}",
                key, descriptor.vendor_id, descriptor.product_id
            );
            return Ok(None);
        }

        let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
        for index in 0..descriptor.num_configurations {
            let bytes = self.backend.config_descriptor(raw.id, index)?;
            let (config, _) = parse_config_descriptor(&bytes, 0)?;
            configurations.push(config);
        }

        Ok(Some(Device::new(
            key,
            raw.address,
            raw.speed,
            raw.id,
            descriptor,
            configurations,
            liveness,
        )))
    }
}
