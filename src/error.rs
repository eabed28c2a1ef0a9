//! Errors reported by the provisioning pipeline.
//!
//! Not finding firmware for a selection is not an error; see
//! [`Resolution`](crate::manifest::Resolution).

use thiserror::Error;

/// Failure while retrieving a firmware image or a manifest.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("`{url}` answered with HTTP status {status}")]
    Status { url: String, status: u16 },

    /// The connection could not be made or dropped mid-stream.
    #[error("could not retrieve `{url}`: {reason}")]
    Transport { url: String, reason: String },

    /// Reading a local file or the response body failed.
    #[error("I/O error while reading firmware: {0}")]
    Io(#[from] std::io::Error),

    /// An inline part could not be decoded.
    #[error("inline firmware payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Failure of the serial transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No usable serial port capability on this host.
    #[error("no serial port available: {0}")]
    Connection(String),

    /// The user cancelled the port selection.
    #[error("port selection was cancelled")]
    Cancelled,

    /// The device refused to open with the requested configuration.
    #[error("could not open `{path}`: {reason}")]
    Open { path: String, reason: String },

    /// The session is not open.
    #[error("the serial session is not open")]
    NotOpen,

    /// Reading from or writing to the port failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad category of a [`ProvisionError`], used to decide what the user has
/// to do next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    Precondition,
    Fetch,
    Connection,
    Open,
    Transfer,
    Integrity,
}

/// Errors terminating a provisioning operation or a connection command.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Something the user must provide is missing: a complete selection, a
    /// published firmware, an open session or the confirmation.
    #[error("cannot provision: {0}")]
    Precondition(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The host has no usable transport.
    #[error("{0}")]
    Connection(String),

    /// The port selection was cancelled or the device refused to open.
    #[error("{0}")]
    Open(String),

    /// Writing the image to the device failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The image digest does not match the manifest and digests are enforced.
    #[error("image digest mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },
}
impl ProvisionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProvisionError::Precondition(_) => ErrorClass::Precondition,
            ProvisionError::Fetch(_) => ErrorClass::Fetch,
            ProvisionError::Connection(_) => ErrorClass::Connection,
            ProvisionError::Open(_) => ErrorClass::Open,
            ProvisionError::Transfer(_) => ErrorClass::Transfer,
            ProvisionError::Integrity { .. } => ErrorClass::Integrity,
        }
    }
}
impl From<TransportError> for ProvisionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connection(_) => ProvisionError::Connection(err.to_string()),
            TransportError::Cancelled | TransportError::Open { .. } => {
                ProvisionError::Open(err.to_string())
            }
            TransportError::NotOpen => ProvisionError::Precondition(err.to_string()),
            TransportError::Io(_) => ProvisionError::Transfer(err.to_string()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn transport_errors_are_classified() {
    let cases = vec![
        (
            TransportError::Connection("none".into()),
            ErrorClass::Connection,
        ),
        (TransportError::Cancelled, ErrorClass::Open),
        (
            TransportError::Open {
                path: "/dev/ttyACM0".into(),
                reason: "busy".into(),
            },
            ErrorClass::Open,
        ),
        (TransportError::NotOpen, ErrorClass::Precondition),
        (
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "unplugged",
            )),
            ErrorClass::Transfer,
        ),
    ];
    for (err, class) in cases {
        assert_eq!(ProvisionError::from(err).class(), class);
    }
}

#[test]
fn fetch_error_message_names_the_url() {
    let err = ProvisionError::from(FetchError::Status {
        url: "https://example.com/fw.bin".into(),
        status: 404,
    });
    assert_eq!(err.class(), ErrorClass::Fetch);
    assert_eq!(
        err.to_string(),
        "`https://example.com/fw.bin` answered with HTTP status 404"
    );
}
