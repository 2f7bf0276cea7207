//! # wirelink-engine
//!
//! Transaction-correlation engine for wirelink.
//!
//! This crate provides:
//! - A dedicated reader thread that assembles frames from a blocking byte stream
//! - Blocking and async request/response correlation by response shape
//! - FIFO command output with single-writer discipline
//! - Event fan-out to listeners on a worker pool
//! - Lifecycle management with a consecutive transport error threshold

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod transaction;
pub mod writer;

#[cfg(test)]
mod testing;

pub use broadcast::{EventBroadcaster, EventListener, ListenerId};
pub use config::{Config, ConfigError, EngineConfig, TransportConfig};
pub use engine::Engine;
pub use error::EngineError;
pub use lifecycle::{EngineState, LifecycleListener};
pub use pool::WorkerPool;
pub use transaction::{ResponseFuture, TransactionId, TransactionRegistry};
pub use writer::OutputWriter;
