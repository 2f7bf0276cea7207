//! Worker pool used for event delivery and asynchronous request completion.
//!
//! The engine either owns a dedicated multi-thread tokio runtime or borrows a
//! handle to one the application already runs. Only an owned runtime is shut
//! down when the engine closes.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Scheduler for work that must stay off the reader thread.
pub struct WorkerPool {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// Creates a pool backed by its own runtime.
    pub fn new(worker_threads: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("wirelink-worker")
            .enable_time()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Creates a pool that schedules onto an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns whether this pool owns (and will shut down) its runtime.
    pub fn is_owned(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Shuts down an owned runtime, cancelling every task still scheduled on it.
    ///
    /// Waits up to `timeout` for blocking work to finish unless called from
    /// inside a runtime, where waiting is not allowed.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(timeout);
        }
        tracing::debug!("Worker pool shut down");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("owned", &self.is_owned())
            .finish()
    }
}
