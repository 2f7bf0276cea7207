//! Engine state machine, transport error accounting and lifecycle listeners.

use crate::broadcast::ListenerId;
use crate::error::EngineError;
use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Closing,
            _ => EngineState::Closed,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Closing => "closing",
            EngineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observer notified when the engine shuts itself down because of an error.
pub trait LifecycleListener: Send + Sync + 'static {
    fn on_closed(&self, error: &EngineError);
}

impl<F> LifecycleListener for F
where
    F: Fn(&EngineError) + Send + Sync + 'static,
{
    fn on_closed(&self, error: &EngineError) {
        self(error)
    }
}

pub(crate) struct Lifecycle {
    state: AtomicU8,
    consecutive_errors: AtomicU32,
    error_threshold: u32,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LifecycleListener>)>>,
}

impl Lifecycle {
    pub(crate) fn new(error_threshold: u32) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Created as u8),
            consecutive_errors: AtomicU32::new(0),
            error_threshold: error_threshold.max(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Returns true while the reader should keep consuming input.
    pub(crate) fn is_accepting(&self) -> bool {
        matches!(self.state(), EngineState::Starting | EngineState::Running)
    }

    /// Completes startup. Fails if the engine began closing in the meantime.
    pub(crate) fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                EngineState::Starting as u8,
                EngineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `Closing`. Only the first caller gets true.
    pub(crate) fn begin_closing(&self) -> bool {
        [EngineState::Running, EngineState::Starting]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        from as u8,
                        EngineState::Closing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            })
    }

    /// Counts a transport failure. Returns true once the threshold is reached.
    pub(crate) fn record_error(&self) -> bool {
        let count = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.error_threshold
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }

    pub(crate) fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Notifies every listener once. Listener panics are logged and swallowed.
    pub(crate) fn notify(&self, error: &EngineError) {
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        for (id, listener) in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_closed(error)));
            if result.is_err() {
                tracing::warn!("Lifecycle {} panicked", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_round_trip() {
        let lifecycle = Lifecycle::new(10);
        assert_eq!(lifecycle.state(), EngineState::Created);

        for state in [
            EngineState::Starting,
            EngineState::Running,
            EngineState::Closing,
            EngineState::Closed,
        ] {
            lifecycle.set_state(state);
            assert_eq!(lifecycle.state(), state);
        }
        assert_eq!(EngineState::Running.to_string(), "running");
    }

    #[test]
    fn test_single_closing_winner() {
        let lifecycle = Arc::new(Lifecycle::new(10));
        lifecycle.set_state(EngineState::Running);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                std::thread::spawn(move || lifecycle.begin_closing())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(lifecycle.state(), EngineState::Closing);
    }

    #[test]
    fn test_mark_running_loses_to_close() {
        let lifecycle = Lifecycle::new(10);
        lifecycle.set_state(EngineState::Starting);
        assert!(lifecycle.is_accepting());
        assert!(lifecycle.begin_closing());

        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.state(), EngineState::Closing);
        assert!(!lifecycle.is_accepting());
    }

    #[test]
    fn test_closing_requires_live_state() {
        let lifecycle = Lifecycle::new(10);
        assert!(!lifecycle.begin_closing());

        lifecycle.set_state(EngineState::Starting);
        assert!(lifecycle.begin_closing());

        lifecycle.set_state(EngineState::Closed);
        assert!(!lifecycle.begin_closing());
    }

    #[test]
    fn test_error_threshold() {
        let lifecycle = Lifecycle::new(3);
        assert!(!lifecycle.record_error());
        assert!(!lifecycle.record_error());
        lifecycle.record_success();
        assert_eq!(lifecycle.consecutive_errors(), 0);

        assert!(!lifecycle.record_error());
        assert!(!lifecycle.record_error());
        assert!(lifecycle.record_error());
    }

    #[test]
    fn test_notify_survives_panicking_listener() {
        let lifecycle = Lifecycle::new(10);
        let calls = Arc::new(AtomicUsize::new(0));

        lifecycle.subscribe(Arc::new(|_: &EngineError| panic!("listener bug")));
        let counter = calls.clone();
        let id = lifecycle.subscribe(Arc::new(move |error: &EngineError| {
            assert!(matches!(error, EngineError::Closed));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        lifecycle.notify(&EngineError::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(lifecycle.unsubscribe(id));
        assert!(!lifecycle.unsubscribe(id));
        lifecycle.notify(&EngineError::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
