//! Engine error types.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use wirelink_protocol::ProtocolError;

/// Errors surfaced to engine callers and lifecycle listeners.
///
/// Cloneable so one failure can be handed to every waiter it affects.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("engine already closed")]
    Closed,

    #[error("request cancelled")]
    Cancelled,

    #[error("engine failed to start: {0}")]
    StartupFailed(String),
}

impl EngineError {
    /// Returns whether retrying the request on the same engine can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Transport(_))
    }

    /// Returns whether the engine is unusable after this error.
    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::Closed | EngineError::StartupFailed(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Transport(Arc::new(err))
    }
}
