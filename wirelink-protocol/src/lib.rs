//! # wirelink-protocol
//!
//! Framing layer for wirelink.
//!
//! This crate provides:
//! - Delimiter-free frame assembly with per-byte header sanity masks
//! - The codec contract used by the engine to turn frames into typed values
//! - A reference codec for the BlueGiga BGAPI protocol (Bluetooth Smart subset)

pub mod assembler;
pub mod bgapi;
pub mod codec;
pub mod error;
pub mod frame;

pub use assembler::{AssemblerStats, FrameAssembler};
pub use codec::{Decoded, FrameCodec};
pub use error::ProtocolError;
pub use frame::{Frame, FrameLayout, HEADER_SIZE};
