//! Descriptor parsing errors

use thiserror::Error;

/// Errors raised while parsing raw descriptor bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The declared length runs past the end of the buffer
    #[error(
        "Descriptor truncated at offset {offset}: declared {declared} bytes, {available} available"
    )]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },

    /// The declared length is shorter than the fixed layout of the descriptor
    #[error("Descriptor at offset {offset} too short: {length} bytes (minimum {minimum})")]
    TooShort {
        offset: usize,
        length: usize,
        minimum: usize,
    },

    /// A mandatory header carries the wrong type tag
    #[error("Unexpected descriptor type {found:#04x} at offset {offset} (expected {expected:#04x})")]
    UnexpectedType {
        offset: usize,
        expected: u8,
        found: u8,
    },
}

/// Type alias for descriptor results
pub type Result<T> = std::result::Result<T, DescriptorError>;
