//! Enumerated devices
//!
//! A [`Device`] is an immutable snapshot of one device on the bus: its
//! topology, speed and parsed descriptors. Snapshots are cheap to clone and
//! share a liveness flag, so every copy observes an unplug.

use crate::backend::BackendDeviceId;
use crate::error::{Result, UsbError};
use descriptor::{ConfigDescriptor, DeviceDescriptor};
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Speed {
    Unknown,
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
    /// 480 Mbit/s
    High,
    /// 5 Gbit/s
    Super,
    /// 10 Gbit/s
    SuperPlus,
}

impl Speed {
    pub fn is_super_speed(self) -> bool {
        matches!(self, Speed::Super | Speed::SuperPlus)
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Speed::Unknown => "unknown",
            Speed::Low => "low (1.5 Mbit/s)",
            Speed::Full => "full (12 Mbit/s)",
            Speed::High => "high (480 Mbit/s)",
            Speed::Super => "super (5 Gbit/s)",
            Speed::SuperPlus => "super+ (10 Gbit/s)",
        };
        f.write_str(name)
    }
}

/// Stable identity of a device across enumerations: bus and port chain
///
/// Bus addresses are reassigned on every re-plug, so they are not part of
/// the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceKey {
    pub bus_number: u8,
    pub port_path: Vec<u8>,
}

impl DeviceKey {
    pub fn new(bus_number: u8, port_path: Vec<u8>) -> Self {
        Self {
            bus_number,
            port_path,
        }
    }
}

/// Formats as `bus-port.port...`, e.g. `1-2.3`
impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.bus_number)?;
        if self.port_path.is_empty() {
            return f.write_str("0");
        }
        for (i, port) in self.port_path.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

/// Presence flag shared by every snapshot of one physical attachment
#[derive(Debug, Default)]
pub(crate) struct Liveness(AtomicBool);

impl Liveness {
    pub(crate) fn mark_gone(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct DeviceInner {
    key: DeviceKey,
    address: u8,
    speed: Speed,
    backend_id: BackendDeviceId,
    descriptor: DeviceDescriptor,
    configurations: Vec<ConfigDescriptor>,
    liveness: Arc<Liveness>,
}

/// Snapshot of an enumerated device
///
/// Equality and hashing use the [`DeviceKey`] only, so the same physical
/// device compares equal across enumerations.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn new(
        key: DeviceKey,
        address: u8,
        speed: Speed,
        backend_id: BackendDeviceId,
        descriptor: DeviceDescriptor,
        configurations: Vec<ConfigDescriptor>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                key,
                address,
                speed,
                backend_id,
                descriptor,
                configurations,
                liveness,
            }),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.inner.key
    }

    pub fn bus_number(&self) -> u8 {
        self.inner.key.bus_number
    }

    pub fn port_path(&self) -> &[u8] {
        &self.inner.key.port_path
    }

    pub fn address(&self) -> u8 {
        self.inner.address
    }

    pub fn speed(&self) -> Speed {
        self.inner.speed
    }

    pub fn vendor_id(&self) -> u16 {
        self.inner.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.inner.descriptor.product_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Configurations in the order the device reports them
    pub fn configurations(&self) -> &[ConfigDescriptor] {
        &self.inner.configurations
    }

    /// Configuration selected by SET_CONFIGURATION `value`
    pub fn configuration(&self, value: u8) -> Option<&ConfigDescriptor> {
        self.inner
            .configurations
            .iter()
            .find(|c| c.configuration_value == value)
    }

    /// True once the device has been seen to disappear
    pub fn is_gone(&self) -> bool {
        self.inner.liveness.is_gone()
    }

    pub(crate) fn backend_id(&self) -> BackendDeviceId {
        self.inner.backend_id
    }

    pub(crate) fn mark_gone(&self) {
        if !self.inner.liveness.is_gone() {
            tracing::info!("Device {} is gone", self.inner.key);
        }
        self.inner.liveness.mark_gone();
    }

    /// Both snapshots describe the same plug-in of the device
    pub(crate) fn same_attachment(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner.liveness, &other.inner.liveness)
    }

    pub(crate) fn ensure_present(&self) -> Result<()> {
        if self.is_gone() {
            Err(UsbError::DeviceGone)
        } else {
            Ok(())
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.inner.key)
            .field("address", &self.inner.address)
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id()))
            .field("product_id", &format_args!("{:#06x}", self.product_id()))
            .field("speed", &self.inner.speed)
            .field("gone", &self.is_gone())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} at {} (address {})",
            self.vendor_id(),
            self.product_id(),
            self.inner.key,
            self.inner.address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{bulk_config, mock_device_descriptor};
    use std::collections::HashSet;

    fn device(port_path: Vec<u8>, address: u8) -> Device {
        Device::new(
            DeviceKey::new(1, port_path),
            address,
            Speed::High,
            BackendDeviceId(u64::from(address)),
            mock_device_descriptor(0x1234, 0x5678),
            vec![bulk_config(1)],
            Arc::new(Liveness::default()),
        )
    }

    #[test]
    fn test_key_display() {
        assert_eq!(DeviceKey::new(1, vec![2, 3]).to_string(), "1-2.3");
        assert_eq!(DeviceKey::new(3, vec![]).to_string(), "3-0");
    }

    #[test]
    fn test_equality_ignores_address() {
        let a = device(vec![2], 5);
        let b = device(vec![2], 9);
        let c = device(vec![3], 5);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_liveness_shared_between_clones() {
        let a = device(vec![1], 4);
        let b = a.clone();
        assert!(a.ensure_present().is_ok());
        b.mark_gone();
        assert!(a.is_gone());
        assert_eq!(a.ensure_present(), Err(UsbError::DeviceGone));
    }

    #[test]
    fn test_configuration_lookup() {
        let d = device(vec![1], 4);
        assert!(d.configuration(1).is_some());
        assert!(d.configuration(2).is_none());
    }
}
