//! Transfer requests and their terminal results

use crate::error::{Result, UsbError};
use descriptor::{Direction, SetupPacket, TransferType};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Identifier assigned to every submitted transfer, unique within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransferId(pub(crate) u64);

impl TransferId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer#{}", self.0)
    }
}

/// What kind of transfer is requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Control transfer; the buffer holds only the data stage
    Control(SetupPacket),
    Bulk,
    Interrupt,
    /// Isochronous transfer split into packets of the given lengths, laid out
    /// back to back in the buffer
    Isochronous { packet_lengths: Vec<u32> },
}

impl TransferKind {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            TransferKind::Control(_) => TransferType::Control,
            TransferKind::Bulk => TransferType::Bulk,
            TransferKind::Interrupt => TransferType::Interrupt,
            TransferKind::Isochronous { .. } => TransferType::Isochronous,
        }
    }
}

/// A transfer request handed to the engine
///
/// The buffer moves into the engine on submission and comes back in the
/// [`CompletedTransfer`]. For IN transfers its length is the number of bytes
/// requested.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub(crate) endpoint: u8,
    pub(crate) kind: TransferKind,
    pub(crate) buffer: Vec<u8>,
    pub(crate) timeout: Duration,
}

impl Transfer {
    /// Control transfer on endpoint 0
    ///
    /// For IN requests `data` is the receive buffer and must be
    /// `setup.length` bytes long.
    pub fn control(setup: SetupPacket, data: Vec<u8>, timeout: Duration) -> Self {
        let endpoint = match setup.direction() {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        Self {
            endpoint,
            kind: TransferKind::Control(setup),
            buffer: data,
            timeout,
        }
    }

    pub fn bulk(endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            endpoint,
            kind: TransferKind::Bulk,
            buffer,
            timeout,
        }
    }

    /// Bulk IN transfer reading up to `length` bytes
    pub fn bulk_in(endpoint: u8, length: usize, timeout: Duration) -> Self {
        Self::bulk(endpoint, vec![0; length], timeout)
    }

    pub fn interrupt(endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> Self {
        Self {
            endpoint,
            kind: TransferKind::Interrupt,
            buffer,
            timeout,
        }
    }

    pub fn isochronous(
        endpoint: u8,
        buffer: Vec<u8>,
        packet_lengths: Vec<u32>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            kind: TransferKind::Isochronous { packet_lengths },
            buffer,
            timeout,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn kind(&self) -> &TransferKind {
        &self.kind
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Zero means wait indefinitely
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }
}

/// Terminal state of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    Errored(UsbError),
}

impl TransferStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            TransferStatus::Completed => Ok(()),
            TransferStatus::TimedOut => Err(UsbError::TransferTimedOut),
            TransferStatus::Cancelled => Err(UsbError::TransferCancelled),
            TransferStatus::Errored(e) => Err(e),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => f.write_str("completed"),
            TransferStatus::TimedOut => f.write_str("timed out"),
            TransferStatus::Cancelled => f.write_str("cancelled"),
            TransferStatus::Errored(e) => write!(f, "error: {}", e),
        }
    }
}

/// Outcome of one isochronous packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoPacketResult {
    /// Requested length
    pub length: u32,
    pub actual_length: u32,
    pub status: TransferStatus,
}

/// A transfer in its terminal state, buffer ownership returned to the caller
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacketResult>,
}

impl CompletedTransfer {
    /// The bytes actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Data received in isochronous packet `index`
    pub fn iso_packet_data(&self, index: usize) -> Option<&[u8]> {
        let packet = self.iso_packets.get(index)?;
        let offset: usize = self.iso_packets[..index]
            .iter()
            .map(|p| p.length as usize)
            .sum();
        let end = (offset + packet.actual_length as usize).min(self.buffer.len());
        self.buffer.get(offset..end)
    }

    /// `Ok(self)` when completed, otherwise the error for the terminal state
    pub fn into_result(self) -> Result<Self> {
        match self.status.clone().into_result() {
            Ok(()) => Ok(self),
            Err(e) => Err(e),
        }
    }
}

/// Callback invoked exactly once, on the event loop thread, when a transfer
/// reaches its terminal state
pub type CompletionCallback = Box<dyn FnOnce(CompletedTransfer) + Send + 'static>;
