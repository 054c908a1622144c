//! Transfer engine
//!
//! Validates transfers against the handle's state and routes them to the
//! event loop. Blocking transfers use the same path as asynchronous ones
//! and wait for their own completion callback.

use crate::error::{Result, UsbError};
use crate::event_loop::EventLoop;
use crate::handle::{HandleEntry, HandleId, HandleManager, HandleState};
use crate::transfer::{CompletedTransfer, CompletionCallback, Transfer, TransferId, TransferKind};
use descriptor::constants::ENDPOINT_NUMBER_MASK;
use descriptor::{Direction, SetupPacket};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, mpsc};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Future resolving to the terminal state of an asynchronously submitted
/// transfer
///
/// Dropping it does not cancel the transfer; use
/// [`Context::cancel_transfer`](crate::Context::cancel_transfer) with
/// [`TransferFuture::id`].
#[derive(Debug)]
pub struct TransferFuture {
    id: TransferId,
    receiver: oneshot::Receiver<CompletedTransfer>,
}

impl TransferFuture {
    pub fn id(&self) -> TransferId {
        self.id
    }
}

impl Future for TransferFuture {
    type Output = Result<CompletedTransfer>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.map_err(|_| {
                UsbError::InternalHostError("event loop stopped before the transfer finished".to_string())
            })
        })
    }
}

pub(crate) struct TransferEngine {
    handles: Arc<HandleManager>,
    event_loop: Arc<EventLoop>,
}

impl TransferEngine {
    pub(crate) fn new(handles: Arc<HandleManager>, event_loop: Arc<EventLoop>) -> Self {
        Self {
            handles,
            event_loop,
        }
    }

    /// Validate and submit; `callback` runs on the event loop thread
    pub(crate) fn submit(
        &self,
        handle: HandleId,
        transfer: Transfer,
        callback: CompletionCallback,
    ) -> Result<TransferId> {
        let entry = self.handles.get(handle)?;

        // Held across submission so a concurrent close sees this transfer
        let state = entry.read();
        validate(&entry, &state, &transfer)?;
        self.event_loop.submit(&entry, transfer, callback)
    }

    pub(crate) fn submit_async(&self, handle: HandleId, transfer: Transfer) -> Result<TransferFuture> {
        let (sender, receiver) = oneshot::channel();
        let id = self.submit(
            handle,
            transfer,
            Box::new(move |completed| {
                let _ = sender.send(completed);
            }),
        )?;
        Ok(TransferFuture { id, receiver })
    }

    /// Submit and block the calling thread until the transfer finishes
    pub(crate) fn transfer_blocking(&self, handle: HandleId, transfer: Transfer) -> Result<CompletedTransfer> {
        if self.event_loop.is_loop_thread() {
            return Err(UsbError::InvalidParam(
                "blocking transfers cannot be issued from a completion callback".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        self.submit(
            handle,
            transfer,
            Box::new(move |completed| {
                let _ = sender.send(completed);
            }),
        )?;

        receiver.recv().map_err(|_| {
            UsbError::InternalHostError("event loop stopped before the transfer finished".to_string())
        })
    }

    pub(crate) fn cancel(&self, id: TransferId) -> bool {
        self.event_loop.cancel(id)
    }

    /// Blocking control transfer on endpoint 0
    ///
    /// `data` must be `setup.length` bytes. IN data is copied into it.
    pub(crate) fn control_transfer(
        &self,
        handle: HandleId,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let transfer = Transfer::control(setup, data.to_vec(), timeout);
        self.data_transfer(handle, transfer, data)
    }

    pub(crate) fn bulk_transfer(
        &self,
        handle: HandleId,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let transfer = Transfer::bulk(endpoint, data.to_vec(), timeout);
        self.data_transfer(handle, transfer, data)
    }

    pub(crate) fn interrupt_transfer(
        &self,
        handle: HandleId,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let transfer = Transfer::interrupt(endpoint, data.to_vec(), timeout);
        self.data_transfer(handle, transfer, data)
    }

    fn data_transfer(&self, handle: HandleId, transfer: Transfer, data: &mut [u8]) -> Result<usize> {
        let direction = transfer.direction();
        let completed = self.transfer_blocking(handle, transfer)?.into_result()?;

        if direction == Direction::In {
            let n = completed.actual_length.min(data.len()).min(completed.buffer.len());
            data[..n].copy_from_slice(&completed.buffer[..n]);
        }
        Ok(completed.actual_length)
    }
}

/// Check a transfer against the handle's current state; never touches the
/// backend
pub(crate) fn validate(entry: &HandleEntry, state: &HandleState, transfer: &Transfer) -> Result<()> {
    if state.closed {
        return Err(UsbError::InvalidHandle);
    }
    entry.device.ensure_present()?;

    let endpoint = transfer.endpoint;
    let is_default_pipe = endpoint & ENDPOINT_NUMBER_MASK == 0;

    if let TransferKind::Control(setup) = &transfer.kind {
        if !is_default_pipe {
            return Err(UsbError::InvalidParam(format!(
                "control transfers go to endpoint 0, not {:#04x}",
                endpoint
            )));
        }
        if usize::from(setup.length) != transfer.buffer.len() {
            return Err(UsbError::InvalidParam(format!(
                "setup length {} does not match buffer of {} bytes",
                setup.length,
                transfer.buffer.len()
            )));
        }
        return Ok(());
    }

    if is_default_pipe {
        return Err(UsbError::InvalidParam(
            "endpoint 0 only carries control transfers".to_string(),
        ));
    }

    let found = entry
        .active_configuration()
        .and_then(|value| entry.device.configuration(value))
        .and_then(|config| config.find_endpoint(endpoint, |i| state.selected_alt(i)));
    let Some((interface, descriptor)) = found else {
        return Err(UsbError::EndpointNotClaimed(endpoint));
    };
    if !state.claimed.contains_key(&interface.interface_number) {
        return Err(UsbError::EndpointNotClaimed(endpoint));
    }

    let expected = transfer.kind.transfer_type();
    if descriptor.transfer_type() != expected {
        return Err(UsbError::InvalidParam(format!(
            "endpoint {:#04x} is {}, not {}",
            endpoint,
            descriptor.transfer_type(),
            expected
        )));
    }

    if let TransferKind::Isochronous { packet_lengths } = &transfer.kind {
        if packet_lengths.is_empty() {
            return Err(UsbError::InvalidParam(
                "isochronous transfer needs at least one packet".to_string(),
            ));
        }
        let total: u64 = packet_lengths.iter().map(|&l| u64::from(l)).sum();
        if total > transfer.buffer.len() as u64 {
            return Err(UsbError::InvalidParam(format!(
                "packet lengths total {} bytes but the buffer holds {}",
                total,
                transfer.buffer.len()
            )));
        }
    }

    Ok(())
}
