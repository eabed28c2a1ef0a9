//! Text lines printed by the device.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, Level::Trace};

/// Log target under which device output is forwarded.
pub const DEVICE_LOG_TARGET: &str = "flashcom::device";

const READ_BUFFER: usize = 4096;
const PAUSE_POLL: Duration = Duration::from_millis(20);

/// How long a pause request waits for the reader to step back. Longer than
/// any port read timeout.
const PARK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct GateState {
    parked: bool,
    finished: bool,
}

/// Hand-over of the input side between the reader and a protocol.
///
/// A pause is only granted once the reader has acknowledged it from outside
/// of any `read()` call, so no byte meant for the protocol is consumed by the
/// reader after the pause returns.
#[derive(Debug, Default)]
pub(crate) struct ReaderGate {
    requested: AtomicBool,
    state: Mutex<GateState>,
    changed: Condvar,
}
impl ReaderGate {
    /// Ask the reader to stop reading and wait for its acknowledgement.
    /// Returns `false` if the reader did not answer within `timeout`.
    pub(crate) fn pause(&self, timeout: Duration) -> bool {
        let state = self.lock();
        self.requested.store(true, Ordering::Release);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.parked && !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.parked || state.finished
    }

    /// Give the input side back to the reader.
    pub(crate) fn resume(&self) {
        let mut state = self.lock();
        state.parked = false;
        self.requested.store(false, Ordering::Release);
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Reader side: acknowledge a pending pause request.
    fn park(&self) {
        let mut state = self.lock();
        if self.is_requested() && !state.parked {
            state.parked = true;
            self.changed.notify_all();
        }
    }

    /// Reader side: the reader will never read again.
    fn finish(&self) {
        let mut state = self.lock();
        state.finished = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lazy sequence of text lines read from a device.
///
/// Bytes are decoded as UTF-8 (lossily), split on `\n` with any trailing `\r`
/// removed. Read timeouts are waited out; the sequence ends when the stream
/// reaches its end, fails, or is stopped. A final unterminated line is yielded
/// before the end.
pub struct DeviceLines<R> {
    reader: R,
    pending: Vec<u8>,
    ready: VecDeque<String>,
    stop: Arc<AtomicBool>,
    gate: Arc<ReaderGate>,
    finished: bool,
}
impl<R: Read> DeviceLines<R> {
    pub fn new(reader: R) -> Self {
        Self::with_flags(
            reader,
            Arc::new(AtomicBool::new(false)),
            Arc::new(ReaderGate::default()),
        )
    }

    pub(crate) fn with_flags(reader: R, stop: Arc<AtomicBool>, gate: Arc<ReaderGate>) -> Self {
        DeviceLines {
            reader,
            pending: Vec::new(),
            ready: VecDeque::new(),
            stop,
            gate,
            finished: false,
        }
    }

    fn split_pending(&mut self) {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.ready
                .push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.gate.finish();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.ready
                .push_back(String::from_utf8_lossy(&rest).into_owned());
        }
    }
}
impl<R: Read> Iterator for DeviceLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.finished {
                return None;
            }
            if self.stop.load(Ordering::Acquire) {
                self.finish();
                continue;
            }
            // Someone else owns the input side for now.
            if self.gate.is_requested() {
                self.gate.park();
                thread::sleep(PAUSE_POLL);
                continue;
            }

            match self.reader.read(&mut buf) {
                Ok(0) => {
                    debug!("device stream ended");
                    self.finish();
                }
                Ok(n) => {
                    if log_enabled!(Trace) {
                        let view = HexViewBuilder::new(&buf[..n])
                            .address_offset(0)
                            .row_width(16)
                            .finish();
                        trace!("received {} bytes\n{}", n, view);
                    }
                    self.pending.extend_from_slice(&buf[..n]);
                    self.split_pending();
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) => {
                    info!("device read error: {}", e);
                    self.finish();
                }
            }
        }
    }
}

/// Background thread draining the device output into the log.
pub(crate) struct ReadLoop {
    stop: Arc<AtomicBool>,
    gate: Arc<ReaderGate>,
    handle: Option<thread::JoinHandle<()>>,
}
impl ReadLoop {
    pub(crate) fn spawn<R: Read + Send + 'static>(reader: R) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(ReaderGate::default());
        let lines = DeviceLines::with_flags(reader, stop.clone(), gate.clone());

        let handle = thread::Builder::new()
            .name("flashcom-reader".into())
            .spawn(move || {
                for line in lines {
                    info!(target: DEVICE_LOG_TARGET, "{}", line);
                }
                debug!("read loop terminated");
            })?;

        Ok(ReadLoop {
            stop,
            gate,
            handle: Some(handle),
        })
    }

    /// Take the input side away from the reader; see [`ReaderGate::pause`].
    pub(crate) fn pause(&self) -> bool {
        self.gate.pause(PARK_TIMEOUT)
    }

    pub(crate) fn gate(&self) -> Arc<ReaderGate> {
        self.gate.clone()
    }

    /// Stop reading and wait for the thread to finish.
    pub(crate) fn cancel(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                info!("read loop panicked");
            }
        }
    }
}
impl Drop for ReadLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out the scripted reads one at a time.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);
    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn splits_lines_and_strips_carriage_returns() {
        let lines: Vec<String> =
            DeviceLines::new(Cursor::new(b"boot ok\r\nheap: 320K\nready".to_vec())).collect();
        assert_eq!(lines, vec!["boot ok", "heap: 320K", "ready"]);
    }

    #[test]
    fn lines_may_span_reads_and_timeouts() {
        let reads = vec![
            Ok(b"ets Jun  8 ".to_vec()),
            Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
            Ok(b"2016\nrst:0x1\n".to_vec()),
        ];
        let lines: Vec<String> = DeviceLines::new(Scripted(reads.into())).collect();
        assert_eq!(lines, vec!["ets Jun  8 2016", "rst:0x1"]);
    }

    #[test]
    fn read_error_ends_the_sequence() {
        let reads = vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            Ok(b"never seen\n".to_vec()),
        ];
        let lines: Vec<String> = DeviceLines::new(Scripted(reads.into())).collect();
        assert_eq!(lines, vec!["partial"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let lines: Vec<String> = DeviceLines::new(Cursor::new(vec![0x66, 0xff, 0x6f, b'\n'])).collect();
        assert_eq!(lines, vec!["f\u{fffd}o"]);
    }

    #[test]
    fn stopped_sequence_ends() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut lines = DeviceLines::with_flags(
            Cursor::new(b"hello\n".to_vec()),
            stop,
            Arc::new(ReaderGate::default()),
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn pause_waits_for_the_reader_to_step_back() {
        struct Slow(Arc<AtomicBool>);
        impl Read for Slow {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                self.0.store(true, Ordering::Release);
                thread::sleep(Duration::from_millis(80));
                self.0.store(false, Ordering::Release);
                Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
            }
        }

        let reading = Arc::new(AtomicBool::new(false));
        let read_loop = ReadLoop::spawn(Slow(reading.clone())).unwrap();
        while !reading.load(Ordering::Acquire) {
            thread::yield_now();
        }
        assert!(read_loop.pause());
        assert!(!reading.load(Ordering::Acquire));
        thread::sleep(Duration::from_millis(100));
        assert!(!reading.load(Ordering::Acquire));

        read_loop.gate().resume();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !reading.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "reader did not resume");
            thread::yield_now();
        }
    }

    #[test]
    fn finished_reader_grants_pause_at_once() {
        let read_loop = ReadLoop::spawn(Cursor::new(Vec::new())).unwrap();
        let started = std::time::Instant::now();
        assert!(read_loop.pause());
        assert!(started.elapsed() < PARK_TIMEOUT);
    }

    #[test]
    fn read_loop_terminates_at_end_of_stream() {
        let mut read_loop = ReadLoop::spawn(Cursor::new(b"line\n".to_vec())).unwrap();
        read_loop.cancel();
        assert!(read_loop.handle.is_none());
    }
}
