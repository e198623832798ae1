//! Error types for the frame codec

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, PacketError>;

/// Codec error. Every malformed input maps to one of these; nothing panics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(usize),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Payload too large for a single frame: {0} bytes")]
    PayloadTooLarge(usize),
}
