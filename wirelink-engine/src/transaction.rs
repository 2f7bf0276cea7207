//! Pending request/response transactions.
//!
//! A transaction is registered before its command is written, so the reply
//! can never overtake it. The reader thread dispatches every decoded response
//! here; the first pending transaction (in registration order) that expects
//! the response's shape and does not see the frame as an echo of its own
//! command claims it. Removal happens under the registry lock, which makes
//! the claim exclusive. Completion happens after the lock is released.

use crate::error::EngineError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wirelink_protocol::{Frame, FrameCodec};

/// Identifier of a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Completion slot of a transaction.
pub(crate) enum Waiter<R> {
    /// A caller thread parked in `send_and_wait`.
    Blocking(mpsc::SyncSender<Result<R, EngineError>>),
    /// The worker task behind a `ResponseFuture`.
    Async(oneshot::Sender<Result<R, EngineError>>),
}

impl<R> Waiter<R> {
    /// Creates a blocking slot and the receiving end for the caller.
    pub(crate) fn blocking() -> (Self, mpsc::Receiver<Result<R, EngineError>>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (Waiter::Blocking(tx), rx)
    }

    /// Creates an async slot and the receiving end for the worker task.
    pub(crate) fn oneshot() -> (Self, oneshot::Receiver<Result<R, EngineError>>) {
        let (tx, rx) = oneshot::channel();
        (Waiter::Async(tx), rx)
    }

    fn complete(self, result: Result<R, EngineError>) {
        // A receiver that is gone has already given up on the result.
        match self {
            Waiter::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
            Waiter::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

struct PendingTransaction<C: FrameCodec> {
    id: TransactionId,
    expected: C::Shape,
    command: Bytes,
    waiter: Waiter<C::Response>,
}

/// Registry of transactions awaiting a response.
pub struct TransactionRegistry<C: FrameCodec> {
    codec: Arc<C>,
    pending: Mutex<Vec<PendingTransaction<C>>>,
    next_id: AtomicU64,
}

impl<C: FrameCodec> TransactionRegistry<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a transaction for `command`, which must be the encoded bytes
    /// about to be written.
    pub(crate) fn register(
        &self,
        expected: C::Shape,
        command: Bytes,
        waiter: Waiter<C::Response>,
    ) -> TransactionId {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pending.lock().push(PendingTransaction {
            id,
            expected,
            command,
            waiter,
        });
        tracing::trace!("Registered {} expecting {:?}", id, expected);
        id
    }

    /// Hands a decoded response to the first matching transaction.
    ///
    /// Returns the response back if no transaction claimed it.
    pub fn dispatch(&self, frame: &Frame, response: C::Response) -> Option<C::Response> {
        let shape = self.codec.response_shape(&response);

        let claimed = {
            let mut pending = self.pending.lock();
            let position = pending
                .iter()
                .position(|t| t.expected == shape && !self.codec.is_echo(&t.command, frame));
            position.map(|index| pending.remove(index))
        };

        match claimed {
            Some(transaction) => {
                tracing::trace!("{} matched response {:?}", transaction.id, shape);
                transaction.waiter.complete(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    /// Removes a transaction without completing it.
    ///
    /// Returns false if it was already completed or removed.
    pub fn cancel(&self, id: TransactionId) -> bool {
        self.take(id).is_some()
    }

    /// Removes a transaction and completes it with `error`.
    pub fn fail(&self, id: TransactionId, error: EngineError) -> bool {
        match self.take(id) {
            Some(transaction) => {
                transaction.waiter.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Completes every pending transaction with `error`. Returns how many there were.
    pub fn fail_all(&self, error: EngineError) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());
        let count = drained.len();
        for transaction in drained {
            transaction.waiter.complete(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!("Failed {} pending transactions: {}", count, error);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn take(&self, id: TransactionId) -> Option<PendingTransaction<C>> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|t| t.id == id)?;
        Some(pending.remove(index))
    }
}

/// Type-erased handle used by a `ResponseFuture` to deregister itself.
pub(crate) trait Cancel: Send + Sync {
    fn cancel_transaction(&self, id: TransactionId, error: Option<EngineError>) -> bool;
}

impl<C: FrameCodec> Cancel for TransactionRegistry<C> {
    fn cancel_transaction(&self, id: TransactionId, error: Option<EngineError>) -> bool {
        match error {
            Some(error) => self.fail(id, error),
            None => self.cancel(id),
        }
    }
}

/// Result of [`Engine::send_async`](crate::Engine::send_async).
///
/// Resolves with the matched response, or with the error that ended the
/// transaction. Dropping the future before it resolves deregisters the
/// transaction.
pub struct ResponseFuture<R> {
    id: TransactionId,
    task: JoinHandle<Result<R, EngineError>>,
    registry: Option<Weak<dyn Cancel>>,
}

impl<R> ResponseFuture<R> {
    pub(crate) fn new(
        id: TransactionId,
        task: JoinHandle<Result<R, EngineError>>,
        registry: Weak<dyn Cancel>,
    ) -> Self {
        Self {
            id,
            task,
            registry: Some(registry),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Cancels the transaction. The future then resolves with
    /// `EngineError::Cancelled` unless a response already claimed it.
    ///
    /// Returns false if the transaction was no longer pending.
    pub fn cancel(&self) -> bool {
        match self.registry.as_ref().and_then(Weak::upgrade) {
            Some(registry) => registry.cancel_transaction(self.id, Some(EngineError::Cancelled)),
            None => false,
        }
    }
}

impl<R> Future for ResponseFuture<R> {
    type Output = Result<R, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            // The pool went away underneath the task.
            Poll::Ready(Err(_)) => Err(EngineError::Closed),
        };
        self.registry = None;
        Poll::Ready(result)
    }
}

impl<R> Drop for ResponseFuture<R> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|r| r.upgrade()) {
            registry.cancel_transaction(self.id, None);
            self.task.abort();
        }
    }
}

impl<R> fmt::Debug for ResponseFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("id", &self.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
