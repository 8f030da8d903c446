//! Error types for the wire protocol.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame signature did not match the protocol magic.
    #[error("invalid frame signature: {0:#010x}")]
    InvalidSignature(u32),

    /// Payload checksum did not match the header.
    #[error("frame checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    /// Message too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),
}
