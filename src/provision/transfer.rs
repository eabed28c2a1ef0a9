//! The two ways of moving an image to the device.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::bootloader::{BootloaderProtocol, ProtocolError};
use crate::error::ProvisionError;
use crate::image::FirmwareImage;
use crate::progress::TransferProgress;
use crate::transport::TransportSession;
use crate::Settings;

use super::{Observer, ProgressKind};

/// Write `data` in slices of `chunk_size` bytes, in order, flushing and
/// pausing for `pacing` after each one. `on_progress` is called after every
/// slice.
///
/// Nothing is read back: the transfer is complete once the last slice has been
/// handed to `writer`.
pub fn write_chunks<W, F>(
    writer: &mut W,
    data: &[u8],
    chunk_size: usize,
    pacing: Duration,
    mut on_progress: F,
) -> io::Result<()>
where
    W: Write + ?Sized,
    F: FnMut(TransferProgress),
{
    let total = data.len() as u64;
    let mut written = 0u64;
    for chunk in data.chunks(chunk_size.max(1)) {
        writer.write_all(chunk)?;
        writer.flush()?;
        written += chunk.len() as u64;
        trace!("{} bytes written, {} of {}", chunk.len(), written, total);
        on_progress(TransferProgress::transfer(written, total));
        if pacing > Duration::from_millis(0) {
            thread::sleep(pacing);
        }
    }
    Ok(())
}

/// Stream the image, segments concatenated, over the session output.
pub(crate) fn raw(
    session: &mut TransportSession,
    image: &FirmwareImage,
    settings: &Settings,
    observer: &mut dyn Observer,
) -> Result<(), ProvisionError> {
    let data = image.contiguous();
    let mut writer = session.writer()?;
    info!(
        "pushing {} bytes in slices of {} bytes",
        data.len(),
        settings.chunk_size
    );
    write_chunks(
        &mut writer,
        &data,
        settings.chunk_size,
        settings.pacing,
        |progress| observer.progress(ProgressKind::Transfer, progress),
    )
    .map_err(|e| ProvisionError::Transfer(e.to_string()))
}

/// Hand the session to the bootloader protocol and write each segment at its
/// address, one after the other. The first failing segment aborts the rest.
pub(crate) fn structured(
    session: &mut TransportSession,
    protocol: &mut dyn BootloaderProtocol,
    image: &FirmwareImage,
    observer: &mut dyn Observer,
) -> Result<(), ProvisionError> {
    fn failed(stage: &str, e: ProtocolError) -> ProvisionError {
        ProvisionError::Transfer(format!("{}: {}", stage, e))
    }

    let mut writer = session.exclusive()?;
    let port = writer.port();

    protocol
        .connect(&mut *port)
        .map_err(|e| failed("bootloader connect", e))?;
    protocol
        .sync(&mut *port)
        .map_err(|e| failed("bootloader sync", e))?;
    let chip = protocol
        .chip_id(&mut *port)
        .map_err(|e| failed("chip identification", e))?;
    info!("bootloader reports chip {}", chip);
    observer.message(&format!("Connected to {}", chip));

    let total = image.len();
    let mut done = 0u64;
    for segment in image.segments() {
        let len = segment.data.len() as u64;
        debug!("writing {} bytes at {:#x}", len, segment.address);
        let base = done;
        protocol
            .write_flash(
                &mut *port,
                std::slice::from_ref(segment),
                &mut |p: TransferProgress| {
                    observer.progress(
                        ProgressKind::Transfer,
                        TransferProgress::transfer(base + p.loaded.min(len), total),
                    )
                },
            )
            .map_err(|e| failed(&format!("flash write at {:#x}", segment.address), e))?;
        done += len;
        observer.progress(
            ProgressKind::Transfer,
            TransferProgress::transfer(done, total),
        );
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Remembers the size of every write.
    #[derive(Default)]
    struct Slices {
        sizes: Vec<usize>,
        bytes: Vec<u8>,
    }
    impl Write for Slices {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sizes.push(buf.len());
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn push(data: &[u8]) -> (Slices, Vec<u8>) {
        let mut slices = Slices::default();
        let mut percents = Vec::new();
        write_chunks(
            &mut slices,
            data,
            16 * 1024,
            Duration::from_millis(0),
            |p| percents.push(p.percent.unwrap()),
        )
        .unwrap();
        (slices, percents)
    }

    #[test]
    fn forty_thousand_bytes() {
        let image: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let (slices, percents) = push(&image);
        assert_eq!(slices.sizes, vec![16384, 16384, 7232]);
        assert_eq!(percents, vec![40, 81, 100]);
        assert_eq!(slices.bytes, image);
    }

    #[test]
    fn chunking_is_exhaustive() {
        for size in &[0usize, 1, 16384, 3 * 16384 + 17] {
            let image: Vec<u8> = (0..*size).map(|i| (i % 241) as u8).collect();
            let (slices, percents) = push(&image);
            assert_eq!(slices.bytes, image, "size {}", size);
            assert!(slices.sizes.iter().all(|s| *s > 0 && *s <= 16384));
            assert!(percents.windows(2).all(|w| w[0] <= w[1]));
            if *size > 0 {
                assert_eq!(percents.last(), Some(&100));
            } else {
                assert!(slices.sizes.is_empty());
            }
        }
    }

    #[test]
    fn write_error_stops_the_transfer() {
        struct Unplugged(usize);
        impl Write for Unplugged {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
                }
                self.0 -= 1;
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut calls = 0;
        let err = write_chunks(
            &mut Unplugged(1),
            &[0u8; 40_000],
            16 * 1024,
            Duration::from_millis(0),
            |_| calls += 1,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(calls, 1);
    }
}
