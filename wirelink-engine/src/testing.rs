//! In-memory transports and a minimal codec for engine tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use wirelink_protocol::{Decoded, Frame, FrameCodec, FrameLayout, ProtocolError, HEADER_SIZE};

/// Four-byte loopback protocol.
///
/// Commands are `[0, 0, 0, v]`, device replies `[0, 0, 1, v]`, events carry
/// bit 7 in the first byte. Byte 1 is a payload length, so a frame never
/// exceeds eight bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub value: u8,
    pub echoed: bool,
}

pub const LOOP_LAYOUT: FrameLayout = FrameLayout {
    masks: [0x70, 0x00, 0xFE, 0x00],
    max_frame_size: 8,
    frame_len: loop_frame_len,
};

fn loop_frame_len(header: &[u8; HEADER_SIZE]) -> usize {
    HEADER_SIZE + header[1] as usize
}

impl FrameCodec for LoopCodec {
    type Command = u8;
    type Response = Reply;
    type Event = u8;
    type Shape = u8;

    fn layout(&self) -> FrameLayout {
        LOOP_LAYOUT
    }

    fn decode(&self, frame: &Frame) -> Result<Option<Decoded<Reply, u8>>, ProtocolError> {
        let [kind, _, origin, value] = frame.header();
        Ok(Some(if kind & 0x80 != 0 {
            Decoded::Event(value)
        } else {
            Decoded::Response(Reply {
                value,
                echoed: origin == 0,
            })
        }))
    }

    fn encode(&self, command: &u8) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(&command_bytes(*command)))
    }

    fn response_shape(&self, response: &Reply) -> u8 {
        response.value
    }
}

pub fn command_bytes(value: u8) -> [u8; 4] {
    [0, 0, 0, value]
}

pub fn reply_bytes(value: u8) -> [u8; 4] {
    [0, 0, 1, value]
}

pub fn event_bytes(value: u8) -> [u8; 4] {
    [0x80, 0, 0, value]
}

/// Device side of an in-memory pipe.
#[derive(Clone)]
pub struct Device {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Device {
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.tx.send(bytes.to_vec());
    }
}

/// Host side of an in-memory pipe. Reads time out like a serial port with a
/// short read timeout; once every `Device` is dropped it reports end of stream.
pub struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffered: VecDeque<u8>,
}

pub fn pipe() -> (Device, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (
        Device { tx },
        PipeReader {
            rx,
            buffered: VecDeque::new(),
        },
    )
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.buffered.extend(chunk),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let mut n = 0;
        while n < buf.len() {
            match self.buffered.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

type FlushHook = Box<dyn FnMut(&[u8]) + Send>;

/// Output sink that accepts a single byte per call and records everything.
///
/// The optional hook sees each flushed command, which lets a test play the
/// device.
pub struct CaptureWriter {
    written: Arc<Mutex<Vec<u8>>>,
    current: Vec<u8>,
    on_flush: Option<FlushHook>,
}

impl CaptureWriter {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let writer = Self {
            written: written.clone(),
            current: Vec::new(),
            on_flush: None,
        };
        (writer, written)
    }

    pub fn with_hook(mut self, hook: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_flush = Some(Box::new(hook));
        self
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(&byte) = buf.first() else {
            return Ok(0);
        };
        self.current.push(byte);
        self.written.lock().push(byte);
        std::thread::yield_now();
        Ok(1)
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.current.is_empty() {
            if let Some(hook) = self.on_flush.as_mut() {
                hook(&self.current);
            }
            self.current.clear();
        }
        Ok(())
    }
}

/// Writer whose every call fails.
pub struct BrokenWriter;

impl Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
    }
}

/// Writer whose flush fails on every second command, counting failures.
pub struct FlakyWriter {
    flushes: usize,
    failures: Arc<AtomicUsize>,
}

impl FlakyWriter {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let failures = Arc::new(AtomicUsize::new(0));
        let writer = Self {
            flushes: 0,
            failures: failures.clone(),
        };
        (writer, failures)
    }
}

impl Write for FlakyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        if self.flushes % 2 == 0 {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line glitch"));
        }
        Ok(())
    }
}

/// Reader that fails every call once armed, counting failed attempts.
///
/// Until armed it behaves like an idle port whose reads time out.
pub struct FailingReader {
    armed: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl FailingReader {
    pub fn new() -> (Self, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let armed = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));
        let reader = Self {
            armed: armed.clone(),
            attempts: attempts.clone(),
        };
        (reader, armed, attempts)
    }
}

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        if !self.armed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::other("read failed"))
    }
}
