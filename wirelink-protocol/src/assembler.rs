//! Byte-at-a-time frame assembly with resynchronization.
//!
//! The assembler is fed one byte at a time from a blocking transport read.
//! While the header is being collected each byte is checked against the
//! layout's mask for its position; a failing byte throws away everything
//! collected so far and header collection restarts at position 0. That is the
//! only recovery mechanism for a corrupted stream since frames carry no
//! checksum.

use crate::frame::{Frame, FrameLayout, HEADER_SIZE};
use bytes::Bytes;

/// Counters describing what the assembler has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Frames handed downstream.
    pub frames: u64,
    /// Header collections abandoned because a byte failed its mask.
    pub resyncs: u64,
    /// Bytes thrown away during resynchronization.
    pub discarded_bytes: u64,
    /// Frames whose declared length exceeded the maximum frame size.
    pub oversized: u64,
}

/// Turns a delimiter-free byte stream into frames.
pub struct FrameAssembler {
    layout: FrameLayout,
    /// Fixed-capacity assembly buffer (capacity = max frame size).
    buffer: Box<[u8]>,
    /// Number of bytes collected for the current frame.
    position: usize,
    /// Declared length of the current frame, known once the header is complete.
    expected: usize,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(layout: FrameLayout) -> Self {
        let capacity = layout.max_frame_size.max(HEADER_SIZE);
        Self {
            layout,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            expected: 0,
            stats: AssemblerStats::default(),
        }
    }

    /// Feeds one byte. Returns a frame when this byte completes one.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        if self.position < HEADER_SIZE {
            if !self.layout.accepts(self.position, byte) {
                tracing::debug!(
                    "Header byte {:#04x} rejected at index {}, discarding {} byte(s)",
                    byte,
                    self.position,
                    self.position + 1
                );
                self.stats.resyncs += 1;
                self.stats.discarded_bytes += self.position as u64 + 1;
                self.position = 0;
                return None;
            }

            self.buffer[self.position] = byte;
            self.position += 1;

            if self.position < HEADER_SIZE {
                return None;
            }

            let header = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
            self.expected = (self.layout.frame_len)(&header).max(HEADER_SIZE);
            if self.expected > self.layout.max_frame_size {
                tracing::warn!(
                    "Declared frame length {} exceeds maximum {} (header {:02x?})",
                    self.expected,
                    self.layout.max_frame_size,
                    header
                );
                self.stats.oversized += 1;
            }
        } else {
            // Oversized frames are still consumed to their declared end, but
            // bytes past the buffer capacity are not stored.
            if self.position < self.buffer.len() {
                self.buffer[self.position] = byte;
            }
            self.position += 1;
        }

        if self.position < self.expected {
            return None;
        }

        let len = self.position;
        self.position = 0;

        if len > self.buffer.len() {
            tracing::debug!("Dropping oversized frame of {} bytes", len);
            self.stats.discarded_bytes += len as u64;
            return None;
        }

        self.stats.frames += 1;
        Some(Frame::from_assembled(Bytes::copy_from_slice(
            &self.buffer[..len],
        )))
    }

    /// Feeds a slice, returning every frame it completes.
    pub fn push_slice(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Number of bytes collected for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.position
    }

    /// Abandons the frame in progress.
    pub fn reset(&mut self) {
        self.position = 0;
        self.expected = 0;
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }
}
