//! The engine: one reader thread, a serialized writer, and the request,
//! event and lifecycle bookkeeping that ties them together.

use crate::broadcast::{EventBroadcaster, EventListener, ListenerId};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lifecycle::{EngineState, Lifecycle, LifecycleListener};
use crate::pool::WorkerPool;
use crate::transaction::{Cancel, ResponseFuture, TransactionId, TransactionRegistry, Waiter};
use crate::writer::{Drained, OutputWriter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{self, BufReader, Read, Write};
use std::sync::{mpsc, Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use wirelink_protocol::{AssemblerStats, Decoded, Frame, FrameAssembler, FrameCodec};

const READER_THREAD_NAME: &str = "wirelink-reader";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A running framing and correlation engine over one pair of byte streams.
///
/// Dropping the engine closes it.
pub struct Engine<C: FrameCodec> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: FrameCodec> {
    codec: Arc<C>,
    config: EngineConfig,
    lifecycle: Lifecycle,
    registry: Arc<TransactionRegistry<C>>,
    broadcaster: EventBroadcaster<C::Event>,
    writer: OutputWriter,
    pool: WorkerPool,
    reader: Mutex<Option<JoinHandle<()>>>,
    frame_stats: Mutex<AssemblerStats>,
}

impl<C: FrameCodec> Engine<C> {
    /// Starts an engine with its own worker pool.
    pub fn open<R, W>(
        codec: C,
        input: R,
        output: W,
        config: EngineConfig,
    ) -> Result<Self, EngineError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let pool = WorkerPool::new(config.worker_threads)
            .map_err(|e| EngineError::StartupFailed(format!("worker pool: {}", e)))?;
        Self::open_with_pool(codec, input, output, config, pool)
    }

    /// Starts an engine on an existing worker pool.
    ///
    /// Spawns the reader thread and waits up to the configured startup
    /// timeout for it to report in.
    pub fn open_with_pool<R, W>(
        codec: C,
        input: R,
        output: W,
        config: EngineConfig,
        pool: WorkerPool,
    ) -> Result<Self, EngineError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let codec = Arc::new(codec);
        let shared = Arc::new(Shared {
            registry: Arc::new(TransactionRegistry::new(codec.clone())),
            broadcaster: EventBroadcaster::new(pool.handle().clone()),
            lifecycle: Lifecycle::new(config.error_threshold),
            writer: OutputWriter::new(output),
            reader: Mutex::new(None),
            frame_stats: Mutex::new(AssemblerStats::default()),
            codec,
            config,
            pool,
        });
        shared.lifecycle.set_state(EngineState::Starting);

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let reader_shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                reader_loop(reader_shared, input);
            });

        let startup_timeout = shared.config.startup_timeout();
        let close_timeout = shared.config.close_timeout();
        match spawned {
            Ok(handle) => *shared.reader.lock() = Some(handle),
            Err(e) => {
                shared.shutdown(None, close_timeout);
                return Err(EngineError::StartupFailed(format!("reader thread: {}", e)));
            }
        }

        if ready_rx.recv_timeout(startup_timeout).is_err() {
            shared.shutdown(None, close_timeout);
            return Err(EngineError::StartupFailed(format!(
                "reader thread did not start within {:?}",
                startup_timeout
            )));
        }

        if !shared.lifecycle.mark_running() {
            shared.shutdown(None, close_timeout);
            return Err(EngineError::StartupFailed(
                "engine closed during startup".to_string(),
            ));
        }

        tracing::info!("Engine running");
        Ok(Self { shared })
    }

    /// Closes the engine. Pending requests fail with `EngineError::Closed`.
    ///
    /// Waits up to `timeout` for the reader thread to exit. Closing an engine
    /// that is already closed is a no-op.
    pub fn close(&self, timeout: Duration) -> Result<(), EngineError> {
        self.shared.shutdown(None, timeout);
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Writes a command without waiting for any response.
    pub fn enqueue(&self, command: &C::Command) -> Result<(), EngineError> {
        self.ensure_running()?;
        let bytes = self.shared.codec.encode(command)?;
        self.shared.write(bytes, None)
    }

    /// Sends a command and blocks until the response of shape `expected`
    /// arrives.
    ///
    /// `timeout` falls back to the configured request timeout when `None`.
    pub fn send_and_wait(
        &self,
        command: &C::Command,
        expected: C::Shape,
        timeout: Option<Duration>,
    ) -> Result<C::Response, EngineError> {
        let (waiter, rx) = Waiter::blocking();
        let id = self.start_transaction(command, expected, waiter)?;
        let registry = &self.shared.registry;

        let Some(limit) = timeout.or_else(|| self.shared.config.request_timeout()) else {
            return rx.recv().unwrap_or(Err(EngineError::Closed));
        };

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if registry.cancel(id) {
                    tracing::debug!("{} timed out after {:?}", id, limit);
                    return Err(EngineError::Timeout(limit));
                }
                // Completed between the deadline and the cancel.
                rx.try_recv().unwrap_or(Err(EngineError::Closed))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::Closed),
        }
    }

    /// Sends a command and returns a future for the response of shape
    /// `expected`.
    ///
    /// The command is written before this returns; the wait runs on the
    /// worker pool.
    pub fn send_async(
        &self,
        command: &C::Command,
        expected: C::Shape,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture<C::Response>, EngineError> {
        let (waiter, rx) = Waiter::oneshot();
        let id = self.start_transaction(command, expected, waiter)?;

        let limit = timeout.or_else(|| self.shared.config.request_timeout());
        let task = self
            .shared
            .pool
            .spawn(await_response(self.shared.registry.clone(), id, rx, limit));
        let registry = Arc::downgrade(&self.shared.registry) as Weak<dyn Cancel>;
        Ok(ResponseFuture::new(id, task, registry))
    }

    pub fn register_event_listener(
        &self,
        listener: impl EventListener<C::Event>,
    ) -> Result<ListenerId, EngineError> {
        self.ensure_running()?;
        Ok(self.shared.broadcaster.subscribe(Arc::new(listener)))
    }

    pub fn unregister_event_listener(&self, id: ListenerId) -> bool {
        self.shared.broadcaster.unsubscribe(id)
    }

    /// Registers a listener told about fatal errors. It is not called for an
    /// explicit `close`.
    pub fn register_lifecycle_listener(
        &self,
        listener: impl LifecycleListener,
    ) -> Result<ListenerId, EngineError> {
        self.ensure_running()?;
        Ok(self.shared.lifecycle.subscribe(Arc::new(listener)))
    }

    pub fn unregister_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.shared.lifecycle.unsubscribe(id)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Framing counters of the reader.
    pub fn frame_stats(&self) -> AssemblerStats {
        *self.shared.frame_stats.lock()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shared.lifecycle.is_running() {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }

    /// Encodes, registers and writes a command.
    fn start_transaction(
        &self,
        command: &C::Command,
        expected: C::Shape,
        waiter: Waiter<C::Response>,
    ) -> Result<TransactionId, EngineError> {
        self.ensure_running()?;
        let bytes = self.shared.codec.encode(command)?;
        let id = self.shared.registry.register(expected, bytes.clone(), waiter);

        // A close that started after the check above has already drained the
        // registry, possibly before this transaction was added.
        if !self.shared.lifecycle.is_running() {
            self.shared.registry.cancel(id);
            return Err(EngineError::Closed);
        }

        self.shared.write(bytes, Some(id))?;
        Ok(id)
    }
}

impl<C: FrameCodec> Drop for Engine<C> {
    fn drop(&mut self) {
        self.shared.shutdown(None, self.shared.config.close_timeout());
    }
}

impl<C: FrameCodec> std::fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl<C: FrameCodec> Shared<C> {
    fn write(&self, bytes: Bytes, transaction: Option<TransactionId>) -> Result<(), EngineError> {
        let (seq, drained) = self.writer.enqueue(bytes, transaction);
        let failure = match drained {
            Drained::Written => {
                self.lifecycle.record_success();
                return Ok(());
            }
            Drained::Empty => return Ok(()),
            Drained::Failed(failure) => failure,
        };

        let error = EngineError::from(failure.error);
        if let Some(id) = failure.transaction {
            self.registry.fail(id, error.clone());
        }
        self.transport_failure(error.clone());

        if failure.seq == seq {
            Err(error)
        } else {
            Ok(())
        }
    }

    fn transport_failure(&self, error: EngineError) {
        if self.lifecycle.record_error() {
            tracing::error!(
                "Transport failed {} times in a row: {}",
                self.lifecycle.consecutive_errors(),
                error
            );
            self.shutdown(Some(error), self.config.close_timeout());
        } else {
            tracing::warn!(
                "Transport error ({} in a row): {}",
                self.lifecycle.consecutive_errors(),
                error
            );
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match self.codec.decode(&frame) {
            Ok(Some(Decoded::Response(response))) => {
                if let Some(unclaimed) = self.registry.dispatch(&frame, response) {
                    tracing::warn!("Dropping unclaimed response {:?}", unclaimed);
                }
            }
            Ok(Some(Decoded::Event(event))) => {
                let delivered = self.broadcaster.notify(event);
                tracing::trace!("Event delivered to {} listeners", delivered);
            }
            Ok(None) => {
                tracing::debug!("Dropping unrecognized frame {:02x?}", frame.header());
            }
            Err(e) => {
                tracing::debug!("Dropping malformed frame {:02x?}: {}", frame.header(), e);
            }
        }
    }

    /// Closes the engine once. `cause` is set when a fatal error triggered the
    /// close and is handed to lifecycle listeners.
    fn shutdown(&self, cause: Option<EngineError>, timeout: Duration) {
        if !self.lifecycle.begin_closing() {
            return;
        }
        match &cause {
            Some(error) => tracing::error!("Engine closing after fatal error: {}", error),
            None => tracing::info!("Engine closing"),
        }

        self.registry.fail_all(EngineError::Closed);
        let dropped = self.writer.clear();
        if dropped > 0 {
            tracing::debug!("Dropped {} unsent commands", dropped);
        }
        self.broadcaster.clear();
        self.pool.shutdown(timeout);
        self.join_reader(timeout);
        self.writer.close(timeout);

        if let Some(error) = &cause {
            self.lifecycle.notify(error);
        }
        self.lifecycle.set_state(EngineState::Closed);
        tracing::info!("Engine closed");
    }

    fn join_reader(&self, timeout: Duration) {
        let Some(handle) = self.reader.lock().take() else {
            return;
        };
        // The reader closing on its own exits right after this returns.
        if handle.thread().id() == std::thread::current().id() {
            return;
        }

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("Reader thread still running after {:?}, detaching", timeout);
                return;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        if handle.join().is_err() {
            tracing::error!("Reader thread panicked");
        }
    }
}

fn reader_loop<C: FrameCodec>(shared: Arc<Shared<C>>, input: impl Read) {
    let mut input = BufReader::new(input);
    let mut assembler = FrameAssembler::new(shared.codec.layout());
    let mut byte = [0u8; 1];
    tracing::debug!("Reader started");

    while shared.lifecycle.is_accepting() {
        match input.read(&mut byte) {
            Ok(0) => shared.transport_failure(EngineError::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input stream ended",
            ))),
            Ok(_) => {
                shared.lifecycle.record_success();
                let frame = assembler.push(byte[0]);
                *shared.frame_stats.lock() = assembler.stats();
                if let Some(frame) = frame {
                    shared.handle_frame(frame);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => shared.transport_failure(EngineError::from(e)),
        }
    }
    tracing::debug!("Reader stopped");
}

async fn await_response<C: FrameCodec>(
    registry: Arc<TransactionRegistry<C>>,
    id: TransactionId,
    mut rx: oneshot::Receiver<Result<C::Response, EngineError>>,
    timeout: Option<Duration>,
) -> Result<C::Response, EngineError> {
    let Some(limit) = timeout else {
        return rx.await.unwrap_or(Err(EngineError::Closed));
    };

    match tokio::time::timeout(limit, &mut rx).await {
        Ok(result) => result.unwrap_or(Err(EngineError::Closed)),
        Err(_) => {
            if registry.cancel(id) {
                tracing::debug!("{} timed out after {:?}", id, limit);
                Err(EngineError::Timeout(limit))
            } else {
                rx.try_recv().unwrap_or(Err(EngineError::Closed))
            }
        }
    }
}
