//! Serialized output path.
//!
//! Callers append encoded commands to a FIFO and then drain exactly one entry
//! while holding the output lock. Popping under that lock means entries reach
//! the wire in the order they were queued, and two commands never interleave.

use crate::transaction::TransactionId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct QueuedCommand {
    seq: u64,
    bytes: Bytes,
    transaction: Option<TransactionId>,
}

/// Write that failed, with the transaction attached to its entry.
#[derive(Debug)]
pub(crate) struct WriteFailure {
    pub seq: u64,
    pub transaction: Option<TransactionId>,
    pub error: io::Error,
}

/// What a single drain step did.
#[derive(Debug)]
pub(crate) enum Drained {
    /// One entry went out.
    Written,
    /// Another caller already drained everything.
    Empty,
    Failed(WriteFailure),
}

/// FIFO command queue in front of the output stream.
pub struct OutputWriter {
    queue: Mutex<VecDeque<QueuedCommand>>,
    output: Mutex<Option<Box<dyn Write + Send>>>,
    next_seq: AtomicU64,
}

impl OutputWriter {
    pub fn new(output: impl Write + Send + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            output: Mutex::new(Some(Box::new(output))),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Queues `bytes` and drains one entry.
    ///
    /// Returns the sequence number assigned to `bytes` together with the
    /// outcome of the drain, which may concern a different caller's entry.
    pub(crate) fn enqueue(
        &self,
        bytes: Bytes,
        transaction: Option<TransactionId>,
    ) -> (u64, Drained) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(QueuedCommand {
            seq,
            bytes,
            transaction,
        });
        (seq, self.drain_one())
    }

    fn drain_one(&self) -> Drained {
        let mut output = self.output.lock();
        let Some(entry) = self.queue.lock().pop_front() else {
            return Drained::Empty;
        };

        let result = match output.as_mut() {
            Some(out) => out.write_all(&entry.bytes).and_then(|_| out.flush()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "output closed")),
        };

        match result {
            Ok(()) => {
                tracing::trace!("Wrote {} bytes (seq {})", entry.bytes.len(), entry.seq);
                Drained::Written
            }
            Err(error) => {
                tracing::warn!("Write of seq {} failed: {}", entry.seq, error);
                Drained::Failed(WriteFailure {
                    seq: entry.seq,
                    transaction: entry.transaction,
                    error,
                })
            }
        }
    }

    /// Number of entries waiting to be written.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drops every queued entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Flushes and releases the output stream. Later drains fail.
    ///
    /// Gives up after `timeout` if a write in progress holds the stream, and
    /// returns false in that case.
    pub fn close(&self, timeout: Duration) -> bool {
        let Some(mut output) = self.output.try_lock_for(timeout) else {
            tracing::warn!("Output still busy after {:?}, leaving it open", timeout);
            return false;
        };
        if let Some(mut out) = output.take() {
            if let Err(e) = out.flush() {
                tracing::debug!("Flush on close failed: {}", e);
            }
        }
        true
    }
}

impl std::fmt::Debug for OutputWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputWriter")
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BrokenWriter, CaptureWriter};
    use std::sync::{mpsc, Arc};
    use std::time::Instant;

    /// Output whose writes block until the test releases them.
    struct StalledWriter {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Write for StalledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writes_in_enqueue_order() {
        let (capture, written) = CaptureWriter::new();
        let writer = OutputWriter::new(capture);

        for value in 0..4u8 {
            let (seq, drained) = writer.enqueue(Bytes::from(vec![value; 3]), None);
            assert_eq!(seq, value as u64);
            assert!(matches!(drained, Drained::Written));
        }

        assert_eq!(*written.lock(), vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_concurrent_commands_never_interleave() {
        let (capture, written) = CaptureWriter::new();
        let writer = Arc::new(OutputWriter::new(capture));

        let handles: Vec<_> = (0..8u8)
            .map(|thread| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for i in 0..25u8 {
                        writer.enqueue(Bytes::from(vec![thread, i, thread, i]), None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let written = written.lock();
        assert_eq!(written.len(), 8 * 25 * 4);
        let mut next = [0u8; 8];
        for chunk in written.chunks(4) {
            let (thread, i) = (chunk[0], chunk[1]);
            assert_eq!(chunk, [thread, i, thread, i]);
            // Per producer, commands appear in the order they were queued.
            assert_eq!(next[thread as usize], i);
            next[thread as usize] += 1;
        }
    }

    #[test]
    fn test_failure_reports_entry() {
        let writer = OutputWriter::new(BrokenWriter);

        let (seq, drained) = writer.enqueue(Bytes::from_static(&[1, 2, 3, 4]), None);
        match drained {
            Drained::Failed(failure) => {
                assert_eq!(failure.seq, seq);
                assert!(failure.transaction.is_none());
                assert_eq!(failure.error.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_output_fails_writes() {
        let (capture, written) = CaptureWriter::new();
        let writer = OutputWriter::new(capture);
        assert!(writer.close(Duration::from_millis(100)));

        let (_, drained) = writer.enqueue(Bytes::from_static(&[9]), None);
        match drained {
            Drained::Failed(failure) => {
                assert_eq!(failure.error.kind(), io::ErrorKind::NotConnected)
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert!(written.lock().is_empty());
    }

    #[test]
    fn test_clear_drops_queued_entries() {
        let (capture, _) = CaptureWriter::new();
        let writer = OutputWriter::new(capture);
        writer.queue.lock().push_back(QueuedCommand {
            seq: 0,
            bytes: Bytes::from_static(&[1]),
            transaction: None,
        });
        assert_eq!(writer.queued(), 1);
        assert_eq!(writer.clear(), 1);
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_close_gives_up_on_stalled_output() {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let writer = Arc::new(OutputWriter::new(StalledWriter {
            entered: entered_tx,
            release: release_rx,
        }));

        let producer = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.enqueue(Bytes::from_static(&[1, 2]), None))
        };
        entered.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        assert!(!writer.close(Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(1));

        release.send(()).unwrap();
        let (_, drained) = producer.join().unwrap();
        assert!(matches!(drained, Drained::Written));
        assert!(writer.close(Duration::from_millis(100)));
    }
}
