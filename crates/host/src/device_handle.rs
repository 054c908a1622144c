//! Scoped device handle
//!
//! [`DeviceHandle`] wraps a [`HandleId`] and closes it when dropped. Closing
//! through the wrapper is idempotent; closing the raw id twice through
//! [`Context::close_handle`] is not.

use crate::context::Context;
use crate::device::Device;
use crate::engine::TransferFuture;
use crate::error::{Result, UsbError};
use crate::handle::HandleId;
use crate::transfer::{CompletedTransfer, Transfer, TransferId};
use descriptor::constants::{DT_STRING, LANGUAGE_ID_EN_US};
use descriptor::{SetupPacket, parse_language_ids, parse_string_descriptor};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Largest descriptor a GET_DESCRIPTOR request can return
const MAX_DESCRIPTOR_LENGTH: u16 = 255;

pub struct DeviceHandle {
    id: HandleId,
    device: Device,
    context: Context,
    closed: bool,
}

impl DeviceHandle {
    pub(crate) fn new(id: HandleId, device: Device, context: Context) -> Self {
        Self {
            id,
            device,
            context,
            closed: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Close now and report the outcome, instead of on drop
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.context.close_handle(self.id)
    }

    pub fn active_configuration(&self) -> Result<Option<u8>> {
        self.context.active_configuration(self.id)
    }

    pub fn set_configuration(&self, value: u8) -> Result<()> {
        self.context.set_configuration(self.id, value)
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        self.context.claim_interface(self.id, interface)
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        self.context.release_interface(self.id, interface)
    }

    pub fn claimed_interfaces(&self) -> Result<Vec<u8>> {
        self.context.claimed_interfaces(self.id)
    }

    pub fn set_alternate_setting(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        self.context
            .set_alternate_setting(self.id, interface, alternate_setting)
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.context.clear_halt(self.id, endpoint)
    }

    pub fn reset(&self) -> Result<()> {
        self.context.reset_device(self.id)
    }

    pub fn control_transfer(&self, setup: SetupPacket, data: &mut [u8], timeout: Duration) -> Result<usize> {
        self.context.control_transfer(self.id, setup, data, timeout)
    }

    /// Control IN request reading up to `buf.len()` bytes
    pub fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let setup = setup_packet(request_type, request, value, index, buf.len())?;
        self.control_transfer(setup, buf, timeout)
    }

    /// Control OUT request sending `buf` in the data stage
    pub fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let setup = setup_packet(request_type, request, value, index, buf.len())?;
        let mut data = buf.to_vec();
        self.control_transfer(setup, &mut data, timeout)
    }

    /// Blocking bulk transfer; IN endpoints fill `data`, OUT endpoints send it
    pub fn bulk_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        self.context.bulk_transfer(self.id, endpoint, data, timeout)
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.bulk_transfer(endpoint, buf, timeout)
    }

    pub fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        let mut data = buf.to_vec();
        self.bulk_transfer(endpoint, &mut data, timeout)
    }

    pub fn interrupt_transfer(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        self.context
            .interrupt_transfer(self.id, endpoint, data, timeout)
    }

    pub fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.interrupt_transfer(endpoint, buf, timeout)
    }

    pub fn write_interrupt(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        let mut data = buf.to_vec();
        self.interrupt_transfer(endpoint, &mut data, timeout)
    }

    pub fn submit_transfer<F>(&self, transfer: Transfer, callback: F) -> Result<TransferId>
    where
        F: FnOnce(CompletedTransfer) + Send + 'static,
    {
        self.context.submit_transfer(self.id, transfer, callback)
    }

    pub fn submit_transfer_async(&self, transfer: Transfer) -> Result<TransferFuture> {
        self.context.submit_transfer_async(self.id, transfer)
    }

    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        self.context.cancel_transfer(id)
    }

    /// Language IDs from string descriptor zero
    pub fn read_languages(&self, timeout: Duration) -> Result<Vec<u16>> {
        let bytes = self.read_string_bytes(0, 0, timeout)?;
        let (languages, _) = parse_language_ids(&bytes, 0)?;
        Ok(languages)
    }

    pub fn read_string_descriptor(&self, index: u8, language_id: u16, timeout: Duration) -> Result<String> {
        if index == 0 {
            return Err(UsbError::InvalidParam(
                "string index 0 holds the language table".to_string(),
            ));
        }
        let bytes = self.read_string_bytes(index, language_id, timeout)?;
        let (text, _) = parse_string_descriptor(&bytes, 0)?;
        Ok(text)
    }

    /// String in the device's first language, non-ASCII characters
    /// replaced with `?`
    pub fn read_string_descriptor_ascii(&self, index: u8, timeout: Duration) -> Result<String> {
        let language = self
            .read_languages(timeout)?
            .first()
            .copied()
            .unwrap_or(LANGUAGE_ID_EN_US);
        let text = self.read_string_descriptor(index, language, timeout)?;
        Ok(text
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect())
    }

    fn read_string_bytes(&self, index: u8, language_id: u16, timeout: Duration) -> Result<Vec<u8>> {
        let setup = SetupPacket::get_descriptor(DT_STRING, index, language_id, MAX_DESCRIPTOR_LENGTH);
        let mut buf = vec![0u8; usize::from(MAX_DESCRIPTOR_LENGTH)];
        let n = self.control_transfer(setup, &mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }
}

fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: usize) -> Result<SetupPacket> {
    let length = u16::try_from(length).map_err(|_| {
        UsbError::InvalidParam(format!("control data stage of {} bytes is too long", length))
    })?;
    Ok(SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    })
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self.context.close_handle(self.id) {
            Ok(()) | Err(UsbError::InvalidHandle) => {}
            Err(e) => warn!("Failed to close {} on drop: {}", self.id, e),
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("closed", &self.closed)
            .finish()
    }
}
