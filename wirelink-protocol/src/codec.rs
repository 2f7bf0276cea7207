//! Contract between the framing engine and a protocol's message codec.
//!
//! The engine only cares whether a decoded frame is a response (it correlates
//! to a command sent earlier) or an event (unsolicited). Everything about the
//! payloads themselves belongs to the codec.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameLayout};
use bytes::Bytes;
use std::fmt;

/// A decoded frame, tagged by how the engine must route it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<R, E> {
    /// Reply to a previously sent command.
    Response(R),
    /// Unsolicited message from the device.
    Event(E),
}

impl<R, E> Decoded<R, E> {
    pub fn is_response(&self) -> bool {
        matches!(self, Decoded::Response(_))
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Decoded::Event(_))
    }
}

/// Converts frames to typed values and commands to bytes.
pub trait FrameCodec: Send + Sync + 'static {
    /// Outbound command type.
    type Command: fmt::Debug + Send + 'static;
    /// Inbound response type.
    type Response: fmt::Debug + Send + 'static;
    /// Inbound event type. Shared between all event listeners.
    type Event: fmt::Debug + Send + Sync + 'static;
    /// Runtime shape of a response, used to match it to a waiting caller.
    type Shape: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// Header layout of this protocol.
    fn layout(&self) -> FrameLayout;

    /// Decodes a structurally valid frame.
    ///
    /// Returns `Ok(None)` when the frame's identifiers are not recognized.
    fn decode(
        &self,
        frame: &Frame,
    ) -> Result<Option<Decoded<Self::Response, Self::Event>>, ProtocolError>;

    /// Serializes a command, header included.
    fn encode(&self, command: &Self::Command) -> Result<Bytes, ProtocolError>;

    /// Returns the shape of a decoded response.
    fn response_shape(&self, response: &Self::Response) -> Self::Shape;

    /// Returns true if `frame` is the just-sent `command` reflected back to us
    /// rather than the device's reply to it.
    fn is_echo(&self, command: &[u8], frame: &Frame) -> bool {
        command == frame.as_bytes()
    }
}
