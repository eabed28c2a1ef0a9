//! The live connection to the device.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use log::{debug, info, trace, warn};

use super::lines::{ReadLoop, ReaderGate};
use super::port::{Port, PortAuthority};
use crate::error::TransportError;
use crate::Settings;

/// Control line levels `(dtr, rts)` applied in order to reset the device into
/// its serial bootloader: release both, hold the chip in reset, strap the boot
/// pin while releasing reset, then release everything.
const BOOTLOADER_ENTRY: &[(bool, bool)] =
    &[(false, false), (false, true), (true, false), (false, false)];

// =============================================================================
// Public Interface
// =============================================================================

/// One open, exclusive connection to the device.
///
/// The session owns the output side of the port; a background thread owns the
/// input side and forwards device output to the log until the session is
/// closed. Writing goes through a [`SessionWriter`] guard, so that only one
/// writer exists at a time and it is always released.
pub struct TransportSession {
    port: Option<Box<dyn Port>>,
    name: String,
    reader: Option<ReadLoop>,
}
impl TransportSession {
    /// Ask `authority` for a port and set it up as a session.
    pub fn open(
        authority: &mut dyn PortAuthority,
        settings: &Settings,
    ) -> Result<Self, TransportError> {
        let port = authority.request(settings)?;
        Ok(Self::from_port(port, settings))
    }

    /// Set up a session over an already opened port: reset the device into
    /// its bootloader when enabled, then start the read loop.
    ///
    /// Neither step can fail the session; problems are logged.
    pub fn from_port(mut port: Box<dyn Port>, settings: &Settings) -> Self {
        let name = port.name().unwrap_or_else(|| "<unnamed>".into());

        if settings.auto_reset {
            match enter_bootloader(&mut *port, settings) {
                Ok(()) => debug!("{} reset into bootloader", name),
                Err(e) => warn!("could not reset {} into bootloader: {}", name, e),
            }
        }

        let reader = match port.try_clone_port() {
            Ok(input) => match ReadLoop::spawn(input) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("could not start the read loop: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("device output will not be shown: {}", e);
                None
            }
        };

        info!("session open on {}", name);
        TransportSession {
            port: Some(port),
            name,
            reader,
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the output side of the session. The read loop keeps running.
    pub fn writer(&mut self) -> Result<SessionWriter<'_>, TransportError> {
        self.acquire(false)
    }

    /// Take both sides of the session: the read loop stops consuming input
    /// until the guard is dropped, so that a protocol can read replies.
    pub fn exclusive(&mut self) -> Result<SessionWriter<'_>, TransportError> {
        self.acquire(true)
    }

    /// Write all of `bytes` and flush.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer()?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Stop the read loop and close the port. Closing a closed session does
    /// nothing.
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.cancel();
        }
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush() {
                debug!("flush on close failed: {}", e);
            }
            info!("session on {} closed", self.name);
        }
    }

    fn acquire(&mut self, exclusive: bool) -> Result<SessionWriter<'_>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let gate = match (&self.reader, exclusive) {
            (Some(reader), true) => {
                if !reader.pause() {
                    warn!("the read loop did not release the input in time");
                }
                Some(reader.gate())
            }
            _ => None,
        };
        trace!("writer acquired (exclusive: {})", exclusive);
        Ok(SessionWriter {
            port: &mut **port,
            gate,
        })
    }
}
impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}
impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("reading", &self.reader.is_some())
            .finish()
    }
}

/// Scoped hold on the session's output stream, released when dropped.
pub struct SessionWriter<'a> {
    port: &'a mut dyn Port,
    gate: Option<Arc<ReaderGate>>,
}
impl<'a> SessionWriter<'a> {
    /// The underlying port, for protocols that drive it directly.
    pub fn port(&mut self) -> &mut (dyn Port + 'a) {
        &mut *self.port
    }
}
impl<'a> Write for SessionWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
impl<'a> Drop for SessionWriter<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.port.flush() {
            debug!("flush on writer release failed: {}", e);
        }
        if let Some(gate) = self.gate.take() {
            gate.resume();
        }
        trace!("writer released");
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn enter_bootloader(port: &mut dyn Port, settings: &Settings) -> io::Result<()> {
    for (dtr, rts) in BOOTLOADER_ENTRY {
        port.set_control_lines(*dtr, *rts)?;
        thread::sleep(settings.reset_settle);
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SettingsBuilder;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorded {
        written: Vec<u8>,
        lines: Vec<(bool, bool)>,
    }

    struct FakePort {
        shared: Arc<Mutex<Recorded>>,
        control_lines: bool,
    }
    impl Read for FakePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }
    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.shared.lock().unwrap().written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Port for FakePort {
        fn name(&self) -> Option<String> {
            Some("fake0".into())
        }
        fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
            if !self.control_lines {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "no modem lines"));
            }
            self.shared.lock().unwrap().lines.push((dtr, rts));
            Ok(())
        }
        fn try_clone_port(&self) -> io::Result<Box<dyn Port>> {
            Ok(Box::new(FakePort {
                shared: self.shared.clone(),
                control_lines: self.control_lines,
            }))
        }
    }

    fn session(control_lines: bool) -> (TransportSession, Arc<Mutex<Recorded>>) {
        let shared = Arc::new(Mutex::new(Recorded::default()));
        let settings = SettingsBuilder::new()
            .reset_settle(Duration::from_millis(0))
            .finalize();
        let port = FakePort {
            shared: shared.clone(),
            control_lines,
        };
        (TransportSession::from_port(Box::new(port), &settings), shared)
    }

    #[test]
    fn open_resets_into_bootloader() {
        let (session, shared) = session(true);
        assert!(session.is_open());
        assert_eq!(session.name(), "fake0");
        assert_eq!(shared.lock().unwrap().lines, BOOTLOADER_ENTRY.to_vec());
    }

    #[test]
    fn missing_control_lines_do_not_abort_open() {
        let (session, shared) = session(false);
        assert!(session.is_open());
        assert!(shared.lock().unwrap().lines.is_empty());
    }

    #[test]
    fn writes_reach_the_port() {
        let (mut session, shared) = session(true);
        session.write(b"abc").unwrap();
        {
            let mut writer = session.exclusive().unwrap();
            writer.write_all(b"def").unwrap();
        }
        assert_eq!(shared.lock().unwrap().written, b"abcdef".to_vec());
    }

    /// A port whose input is fed by the test; reads wait for data like a
    /// serial port with a read timeout.
    #[derive(Clone, Default)]
    struct Pipe(Arc<(Mutex<VecDeque<u8>>, Condvar)>);
    impl Pipe {
        fn feed(&self, bytes: &[u8]) {
            let (input, arrived) = &*self.0;
            input.lock().unwrap().extend(bytes);
            arrived.notify_all();
        }
        fn pending(&self) -> usize {
            (self.0).0.lock().unwrap().len()
        }
    }
    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let (input, arrived) = &*self.0;
            let (mut input, _) = arrived
                .wait_timeout_while(input.lock().unwrap(), Duration::from_millis(100), |i| {
                    i.is_empty()
                })
                .unwrap();
            if input.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
            }
            let n = buf.len().min(input.len());
            for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }
    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Port for Pipe {
        fn name(&self) -> Option<String> {
            Some("pipe0".into())
        }
        fn set_control_lines(&mut self, _dtr: bool, _rts: bool) -> io::Result<()> {
            Ok(())
        }
        fn try_clone_port(&self) -> io::Result<Box<dyn Port>> {
            Ok(Box::new(self.clone()))
        }
    }

    #[test]
    fn exclusive_writer_receives_replies_sent_after_acquiring() {
        let pipe = Pipe::default();
        let settings = SettingsBuilder::new().auto_reset(false).finalize();
        let mut session = TransportSession::from_port(Box::new(pipe.clone()), &settings);
        // let the read loop block in read()
        thread::sleep(Duration::from_millis(30));

        {
            let mut writer = session.exclusive().unwrap();
            pipe.feed(b"SYNC-REPLY");
            let mut reply = [0u8; 10];
            writer.port().read_exact(&mut reply).unwrap();
            assert_eq!(&reply, b"SYNC-REPLY");
        }

        pipe.feed(b"boot log\n");
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipe.pending() > 0 {
            assert!(Instant::now() < deadline, "read loop did not resume");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, _) = session(true);
        session.close();
        assert!(!session.is_open());
        session.close();
        assert!(!session.is_open());
        assert!(matches!(session.write(b"x"), Err(TransportError::NotOpen)));
    }
}
