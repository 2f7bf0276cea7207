//! Protocol error types.

use thiserror::Error;

/// Errors raised while validating frames or encoding/decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid header byte {byte:#04x} at index {index} (mask {mask:#04x})")]
    InvalidHeader { index: usize, byte: u8, mask: u8 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },

    #[error("unknown message: class {class:#04x}, command {command:#04x}")]
    UnknownMessage { class: u8, command: u8 },

    #[error("field '{field}' too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}
