//! Event fan-out to registered listeners.
//!
//! Every listener gets its own queue and a forwarder task on the worker pool.
//! Broadcasting only pushes into those queues, so the reader thread never
//! waits on listener code. The forwarder invokes its listener on the pool's
//! blocking section, one event at a time, which keeps per-listener ordering
//! and confines a slow or panicking listener to its own queue.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Queued events per listener at which a warning is logged, and again at
/// every further multiple.
const BACKLOG_WARN_STEP: usize = 256;

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Observer of unsolicited device events.
pub trait EventListener<E>: Send + Sync + 'static {
    fn on_event(&self, event: &E);
}

impl<E, F> EventListener<E> for F
where
    F: Fn(&E) + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

struct Subscription<E> {
    tx: mpsc::UnboundedSender<Arc<E>>,
    backlog: Arc<AtomicUsize>,
}

/// Fans events out to listeners through per-listener queues.
pub struct EventBroadcaster<E> {
    subscriptions: DashMap<ListenerId, Subscription<E>>,
    handle: Handle,
}

impl<E> EventBroadcaster<E>
where
    E: Send + Sync + 'static,
{
    /// Creates a broadcaster whose forwarders run on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            subscriptions: DashMap::new(),
            handle,
        }
    }

    /// Registers a listener and starts its forwarder.
    pub fn subscribe(&self, listener: Arc<dyn EventListener<E>>) -> ListenerId {
        let id = ListenerId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        self.handle.spawn(forward(id, listener, rx, backlog.clone()));
        self.subscriptions.insert(id, Subscription { tx, backlog });
        tracing::debug!("Registered event {}", id);
        id
    }

    /// Removes a listener. Events already queued for it are still delivered.
    ///
    /// Returns true if the listener was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Queues an event for every listener. Returns how many listeners it reached.
    pub fn notify(&self, event: E) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            let queued = subscription.backlog.fetch_add(1, Ordering::AcqRel) + 1;
            if subscription.tx.send(event.clone()).is_ok() {
                delivered += 1;
                if queued % BACKLOG_WARN_STEP == 0 {
                    tracing::warn!(
                        "Event {} is falling behind: {} events queued",
                        entry.key(),
                        queued
                    );
                }
            } else {
                dead.push(*entry.key());
            }
        }

        // Forwarders only stop early when their runtime goes away.
        for id in dead {
            tracing::debug!("Dropping event {} whose forwarder has stopped", id);
            self.subscriptions.remove(&id);
        }

        delivered
    }

    /// Removes every listener, ending their forwarders.
    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    /// Returns the number of registered listeners.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Events queued for a listener and not yet handled.
    pub fn backlog(&self, id: ListenerId) -> Option<usize> {
        self.subscriptions
            .get(&id)
            .map(|s| s.backlog.load(Ordering::Acquire))
    }
}

async fn forward<E>(
    id: ListenerId,
    listener: Arc<dyn EventListener<E>>,
    mut rx: mpsc::UnboundedReceiver<Arc<E>>,
    backlog: Arc<AtomicUsize>,
) where
    E: Send + Sync + 'static,
{
    while let Some(event) = rx.recv().await {
        let listener = listener.clone();
        let result = tokio::task::spawn_blocking(move || listener.on_event(&event)).await;
        backlog.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                tracing::warn!("Event {} panicked while handling an event", id);
            }
            Err(_) => break,
        }
    }
    tracing::debug!("Event forwarder for {} stopped", id);
}
