//! Flashcom provisions firmware onto a microcontroller over a serial link.
//!
//! Given a user selection (software variant, hardware revision, display
//! module), `flashcom` looks up the firmware published for it in a manifest,
//! downloads and verifies the image, and writes it to the device either
//! through a chip bootloader protocol, when one is plugged in, or as a raw
//! chunked stream that a cooperating receiver on the device consumes.
//!
//! The pipeline is driven by an [`Orchestrator`], which owns the session and
//! the rest of the context and only reacts to [`Command`]s. The provisioning
//! operation itself is a state machine with the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * Data shared by all states is lent to them through a context.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions are permitted and as many errors as
//!   possible are detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state.
//!   Data is transferred from one state to the next by attaching it to the
//!   transition event.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern. Only transitions for which the `From` trait is implemented are
//! authorized and any other transition would be detected at compile-time as an
//! error.

mod bootloader;
mod digest;
mod error;
mod fetch;
mod image;
mod manifest;
mod orchestrator;
mod progress;
mod provision;
mod settings;
mod transport;

pub use bootloader::{BootloaderCapability, BootloaderProtocol, ProtocolError};
pub use digest::digest;
pub use error::{ErrorClass, FetchError, ProvisionError, TransportError};
pub use fetch::{fetch, fetch_location};
pub use image::{FirmwareImage, FlashSegment};
pub use manifest::{
    canonical_variant, resolve, resolve_selection, FirmwareDescriptor, FirmwareLayout, FlashPart,
    Manifest, PartSource, Resolution, Selection, SelectionKey,
};
pub use orchestrator::{Command, Orchestrator, Response};
pub use progress::TransferProgress;
pub use provision::{
    write_chunks, AutoConfirm, Confirmation, NoopObserver, Observer, Phase, ProgressKind,
    ProvisionReport, Strategy,
};
pub use settings::{Settings, SettingsBuilder, DEFAULT_CHUNK_SIZE, DEFAULT_FLASH_ADDRESS};
pub use transport::{
    available_ports, DeviceLines, Port, PortAuthority, SerialAuthority, SerialLink,
    SessionWriter, TransportSession, DEVICE_LOG_TARGET,
};
