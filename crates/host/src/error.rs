//! USB host error types
//!
//! Every failing operation returns one of these kinds so callers can decide
//! on a retry policy without inspecting messages.

use descriptor::DescriptorError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// No backend could be initialized, or the bus could not be listed
    #[error("USB host controller unavailable: {0}")]
    HostControllerUnavailable(String),

    /// The device was unplugged since it was enumerated
    #[error("Device is no longer present")]
    DeviceGone,

    /// The OS refused access to the device
    #[error("Access denied (insufficient permissions)")]
    AccessDenied,

    /// OS or context limit on open handles reached
    #[error("Too many open device handles")]
    TooManyOpenHandles,

    /// The handle was closed or never existed
    #[error("Invalid or closed device handle")]
    InvalidHandle,

    /// Configuration changes need every interface released first
    #[error("Cannot change configuration while interfaces {0:?} are claimed")]
    InterfacesStillClaimed(Vec<u8>),

    /// Another handle (or process) holds the interface
    #[error("Interface {0} is claimed by another handle")]
    InterfaceBusy(u8),

    /// The endpoint is not part of a claimed interface of the active configuration
    #[error("Endpoint {0:#04x} does not belong to a claimed interface")]
    EndpointNotClaimed(u8),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(#[from] DescriptorError),

    #[error("Transfer timed out")]
    TransferTimedOut,

    /// The endpoint answered with STALL; clear it with `clear_halt` before reuse
    #[error("Endpoint stalled")]
    TransferStalled,

    #[error("Transfer cancelled")]
    TransferCancelled,

    /// The device went away while the transfer was in flight
    #[error("Device disconnected during transfer")]
    Disconnected,

    /// The device sent more data than the buffer could hold
    #[error("Transfer overflow")]
    TransferOverflow,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Unexpected failure reported by the native host stack
    #[error("Internal host controller error: {0}")]
    InternalHostError(String),
}

impl UsbError {
    /// Whether repeating the operation can succeed
    ///
    /// A stalled endpoint is retryable once the caller has cleared the halt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UsbError::TransferTimedOut
                | UsbError::TransferStalled
                | UsbError::TransferCancelled
                | UsbError::InterfaceBusy(_)
                | UsbError::TooManyOpenHandles
        )
    }

    /// Whether the device behind the operation is gone for good
    pub fn is_disconnect(&self) -> bool {
        matches!(self, UsbError::DeviceGone | UsbError::Disconnected)
    }
}

pub type Result<T> = std::result::Result<T, UsbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(UsbError::TransferStalled.is_retryable());
        assert!(UsbError::TransferTimedOut.is_retryable());
        assert!(!UsbError::DeviceGone.is_retryable());
        assert!(!UsbError::Disconnected.is_retryable());
        assert!(!UsbError::EndpointNotClaimed(0x81).is_retryable());
    }

    #[test]
    fn test_descriptor_error_converts() {
        let err: UsbError = DescriptorError::TooShort {
            offset: 0,
            length: 4,
            minimum: 18,
        }
        .into();
        assert!(matches!(err, UsbError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_error_display() {
        let msg = UsbError::EndpointNotClaimed(0x81).to_string();
        assert!(msg.contains("0x81"));
        let msg = UsbError::InterfacesStillClaimed(vec![0, 2]).to_string();
        assert!(msg.contains("[0, 2]"));
    }
}
