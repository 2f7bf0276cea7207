//! Frame layout and the assembled frame type.
//!
//! A frame is a fixed 4-byte header followed by a payload whose length is
//! carried in the header:
//!
//! ```text
//! +--------+--------+--------+--------+---------------------+
//! | byte 0 | byte 1 | byte 2 | byte 3 | payload             |
//! +--------+--------+--------+--------+---------------------+
//! ```
//!
//! There is no delimiter and no checksum. The only integrity checks are the
//! per-byte header masks (a header byte is valid when `byte & mask == 0`) and
//! the declared length. What the header bytes mean beyond that is up to the
//! protocol's [`FrameLayout`].

use crate::error::ProtocolError;
use bytes::Bytes;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Describes how a protocol lays out its header.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    /// Sanity mask per header byte. A byte is rejected if any masked bit is set.
    pub masks: [u8; HEADER_SIZE],
    /// Upper bound on the total frame size (header included).
    pub max_frame_size: usize,
    /// Computes the declared total frame length (header included) from a header.
    pub frame_len: fn(&[u8; HEADER_SIZE]) -> usize,
}

impl FrameLayout {
    /// Returns true if `byte` is acceptable at header position `index`.
    pub fn accepts(&self, index: usize, byte: u8) -> bool {
        byte & self.masks[index] == 0
    }

    /// Checks a complete header against every mask.
    pub fn validate_header(&self, header: &[u8; HEADER_SIZE]) -> Result<(), ProtocolError> {
        for (index, byte) in header.iter().enumerate() {
            if !self.accepts(index, *byte) {
                return Err(ProtocolError::InvalidHeader {
                    index,
                    byte: *byte,
                    mask: self.masks[index],
                });
            }
        }
        Ok(())
    }
}

/// A complete, length-validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Builds a frame from raw bytes, checking header masks and declared length.
    pub fn parse(layout: &FrameLayout, bytes: Bytes) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::PayloadLength {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let header: [u8; HEADER_SIZE] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        layout.validate_header(&header)?;

        let declared = (layout.frame_len)(&header);
        if declared > layout.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: layout.max_frame_size,
            });
        }
        if declared != bytes.len() {
            return Err(ProtocolError::PayloadLength {
                expected: declared,
                actual: bytes.len(),
            });
        }

        Ok(Self { bytes })
    }

    /// Wraps bytes the assembler has already validated.
    pub(crate) fn from_assembled(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Returns the four header bytes.
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }

    /// Returns the payload (everything after the header).
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Returns the full wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total length in bytes, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Frames always carry a header, so this is never true for a parsed frame.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
