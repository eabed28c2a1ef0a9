//! Bootloader protocol capability.
//!
//! Chip-aware flashing (sync, chip identification, framed flash writes) is not
//! implemented by `flashcom`: it is provided by an external protocol library
//! plugged in through [`BootloaderProtocol`]. Whether such a library is
//! present is decided once, when the [`Orchestrator`](crate::Orchestrator) is
//! built, by handing it a [`BootloaderCapability`].

use std::error::Error;
use std::fmt;

use crate::image::FlashSegment;
use crate::progress::TransferProgress;
use crate::transport::Port;

/// Error type returned by protocol implementations.
pub type ProtocolError = Box<dyn Error + Send + Sync>;

/// A chip bootloader protocol driven over an open port.
///
/// Calls happen in this order for one transfer: [`connect`](Self::connect),
/// [`sync`](Self::sync), [`chip_id`](Self::chip_id), then one
/// [`write_flash`](Self::write_flash) per segment.
pub trait BootloaderProtocol: Send {
    /// Take over the port, e.g. adjust line settings or drain stale input.
    fn connect(&mut self, port: &mut dyn Port) -> Result<(), ProtocolError>;

    /// Perform the bootloader handshake.
    fn sync(&mut self, port: &mut dyn Port) -> Result<(), ProtocolError>;

    /// Identify the connected chip.
    fn chip_id(&mut self, port: &mut dyn Port) -> Result<String, ProtocolError>;

    /// Write `segments` to flash. `progress` receives the bytes written within
    /// the call.
    fn write_flash(
        &mut self,
        port: &mut dyn Port,
        segments: &[FlashSegment],
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), ProtocolError>;
}

/// Whether a bootloader protocol is available on this host.
pub enum BootloaderCapability {
    Available(Box<dyn BootloaderProtocol>),
    Unavailable,
}
impl BootloaderCapability {
    pub fn is_available(&self) -> bool {
        matches!(self, BootloaderCapability::Available(_))
    }
}
impl Default for BootloaderCapability {
    fn default() -> Self {
        BootloaderCapability::Unavailable
    }
}
impl From<Option<Box<dyn BootloaderProtocol>>> for BootloaderCapability {
    fn from(protocol: Option<Box<dyn BootloaderProtocol>>) -> Self {
        match protocol {
            Some(protocol) => BootloaderCapability::Available(protocol),
            None => BootloaderCapability::Unavailable,
        }
    }
}
impl fmt::Debug for BootloaderCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootloaderCapability::Available(_) => f.write_str("Available"),
            BootloaderCapability::Unavailable => f.write_str("Unavailable"),
        }
    }
}
