//! Retrieval of firmware images.
//!
//! A source is either a `http://`/`https://` URL, a path on the local file
//! system, or a base64 payload embedded in the manifest. Remote and file
//! sources are read in chunks and report byte-level progress; inline payloads
//! decode in a single step without progress.

use std::fs::File;
use std::io::{self, Read};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, trace};

use crate::error::FetchError;
use crate::manifest::PartSource;
use crate::progress::TransferProgress;

const READ_CHUNK: usize = 8 * 1024;

/// Whether `location` must be retrieved over the network.
pub fn is_remote(location: &str) -> bool {
    let lower = location.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Fetch the bytes of one flash part.
pub fn fetch<F>(source: &PartSource, on_progress: F) -> Result<Vec<u8>, FetchError>
where
    F: FnMut(TransferProgress),
{
    match source {
        PartSource::Remote(location) => fetch_location(location, on_progress),
        PartSource::Inline(data) => {
            let bytes = STANDARD.decode(data.trim())?;
            debug!("decoded {} bytes of inline firmware", bytes.len());
            Ok(bytes)
        }
    }
}

/// Fetch the bytes stored at a URL or a file path.
pub fn fetch_location<F>(location: &str, on_progress: F) -> Result<Vec<u8>, FetchError>
where
    F: FnMut(TransferProgress),
{
    if is_remote(location) {
        let response = get(location)?;
        let total = response
            .header("Content-Length")
            .and_then(|len| len.trim().parse::<u64>().ok());
        debug!("downloading {} ({:?} bytes)", location, total);
        read_with_progress(response.into_reader(), total, on_progress).map_err(|e| {
            FetchError::Transport {
                url: location.to_owned(),
                reason: e.to_string(),
            }
        })
    } else {
        let file = File::open(location)?;
        let total = file.metadata().ok().map(|meta| meta.len());
        debug!("reading {} ({:?} bytes)", location, total);
        Ok(read_with_progress(file, total, on_progress)?)
    }
}

/// Read a whole text document, such as the manifest.
pub fn read_text(location: &str) -> Result<String, FetchError> {
    if is_remote(location) {
        get(location)?
            .into_string()
            .map_err(|e| FetchError::Transport {
                url: location.to_owned(),
                reason: e.to_string(),
            })
    } else {
        Ok(std::fs::read_to_string(location)?)
    }
}

fn get(url: &str) -> Result<ureq::Response, FetchError> {
    match ureq::get(url).call() {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(status, _)) => Err(FetchError::Status {
            url: url.to_owned(),
            status,
        }),
        Err(ureq::Error::Transport(transport)) => Err(FetchError::Transport {
            url: url.to_owned(),
            reason: transport.to_string(),
        }),
    }
}

/// Drain `reader` into one buffer, reporting progress after every chunk.
///
/// A stream that ends before the announced `total` is reported as
/// `UnexpectedEof`.
pub(crate) fn read_with_progress<R, F>(
    mut reader: R,
    total: Option<u64>,
    mut on_progress: F,
) -> io::Result<Vec<u8>>
where
    R: Read,
    F: FnMut(TransferProgress),
{
    let capacity = total.map_or(0, |t| t.min(64 * 1024 * 1024) as usize);
    let mut image = Vec::with_capacity(capacity);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        image.extend_from_slice(&chunk[..read]);
        trace!("{} bytes received, {} so far", read, image.len());
        on_progress(TransferProgress::download(image.len() as u64, total));
    }

    if let Some(total) = total {
        if (image.len() as u64) < total {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended after {} of {} bytes",
                    image.len(),
                    total
                ),
            ));
        }
    }
    Ok(image)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn concatenates_chunks_in_order() {
        let image: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut events = Vec::new();
        let fetched =
            read_with_progress(Cursor::new(image.clone()), Some(40_000), |p| events.push(p))
                .unwrap();
        assert_eq!(fetched, image);
        assert_eq!(events.len(), 5);
        assert_eq!(events.last().unwrap().percent, Some(100));
        assert!(events.windows(2).all(|w| w[0].loaded < w[1].loaded));
    }

    #[test]
    fn unknown_length_reports_indeterminate_progress() {
        let mut events = Vec::new();
        read_with_progress(Cursor::new(vec![1u8; 100]), None, |p| events.push(p)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_indeterminate());
        assert_eq!(events[0].loaded, 100);
    }

    #[test]
    fn truncated_stream_fails() {
        let err = read_with_progress(Cursor::new(vec![0u8; 10]), Some(20), |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn inline_source_decodes_without_progress() {
        let mut calls = 0;
        let bytes = fetch(&PartSource::Inline("qrvM3Q==".into()), |_| calls += 1).unwrap();
        assert_eq!(bytes, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(calls, 0);
    }

    #[test]
    fn invalid_inline_source_fails() {
        let err = fetch(&PartSource::Inline("not base64!".into()), |_| {}).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn file_source_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![7u8; 20_000]).unwrap();

        let mut last = None;
        let bytes = fetch_location(&path.to_string_lossy(), |p| last = Some(p)).unwrap();
        assert_eq!(bytes.len(), 20_000);
        assert_eq!(last.unwrap().percent, Some(100));
    }

    #[test]
    fn missing_file_is_a_fetch_error() {
        let err = fetch_location("/definitely/not/here.bin", |_| {}).unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }

    /// Answer the next HTTP request on a local port with `response`, then
    /// hang up. Returns the URL to request.
    fn serve_once(response: Vec<u8>) -> String {
        use std::io::Write;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/fw.bin", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(&response);
        });
        url
    }

    fn ok_response(announced: usize, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n",
            announced
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    #[test]
    fn http_error_status_is_reported() {
        let url = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        );
        match fetch_location(&url, |_| {}).unwrap_err() {
            FetchError::Status { url: failed, status } => {
                assert_eq!(status, 404);
                assert_eq!(failed, url);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn http_download_reports_progress_from_content_length() {
        let image: Vec<u8> = (0..20_000u32).map(|i| (i % 239) as u8).collect();
        let url = serve_once(ok_response(image.len(), &image));

        let mut events = Vec::new();
        let fetched = fetch_location(&url, |p| events.push(p)).unwrap();
        assert_eq!(fetched, image);
        assert!(!events.is_empty());
        assert!(events.iter().all(|p| p.total == Some(20_000)));
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.last().unwrap().percent, Some(100));
    }

    #[test]
    fn http_stream_cut_short_is_a_transport_error() {
        let url = serve_once(ok_response(20_000, &[0x55; 5_000]));
        let err = fetch_location(&url, |_| {}).unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }), "{:?}", err);
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let url = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}/fw.bin", listener.local_addr().unwrap())
        };
        let err = fetch_location(&url, |_| {}).unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }), "{:?}", err);
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://example.com/fw.bin"));
        assert!(is_remote("HTTP://example.com/fw.bin"));
        assert!(!is_remote("/tmp/fw.bin"));
        assert!(!is_remote("fw.bin"));
    }
}
