//! `flashcom` provisioning state machine.
//!
//! One provisioning operation resolves the current selection into a firmware
//! descriptor, fetches and verifies the image, then writes it to the device
//! over the open session. The collaborators the operation reports to and asks
//! for confirmation are the [`Observer`] and [`Confirmation`] traits defined
//! here.
//!
//! The operation is normally started through the
//! [`Orchestrator`](crate::Orchestrator):
//! ```ignore
//! let report = orchestrator.dispatch(Command::Provision)?;
//! ```

mod events;
mod state_machine;
mod states;
mod transfer;

use crate::error::ProvisionError;
use crate::manifest::Resolution;
use crate::progress::TransferProgress;

pub(crate) use state_machine::{provision, Context};
pub use transfer::write_chunks;

/// Steps of a provisioning operation, as announced to the [`Observer`].
///
/// `Transferring` is announced a second time when the raw stream takes over
/// from a failed bootloader transfer; transfer progress starts again from
/// zero after it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Idle,
    ResolvingDescriptor,
    Fetching,
    Verifying,
    Transferring,
    Completed,
    Failed,
}

/// What a [`TransferProgress`] is measuring.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProgressKind {
    Download,
    Transfer,
}

/// How the image reached the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Strategy {
    /// Through the bootloader protocol capability.
    Structured,
    /// Raw, unacknowledged chunked stream.
    Raw,
}

/// Summary of a completed provisioning operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProvisionReport {
    pub version: String,
    pub bytes: u64,
    /// SHA-256 of each fetched segment, in write order.
    pub digests: Vec<String>,
    pub strategy: Strategy,
    /// `true` when the structured path failed and the raw path took over.
    pub fell_back: bool,
}

/// Blocking yes/no question to the user.
pub trait Confirmation {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Answers every question the same way; useful for unattended runs and tests.
#[derive(Debug, Copy, Clone)]
pub struct AutoConfirm(pub bool);
impl Confirmation for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        self.0
    }
}

/// Receives state change notifications. Every method defaults to doing
/// nothing.
pub trait Observer {
    fn phase(&mut self, _phase: Phase) {}

    fn progress(&mut self, _kind: ProgressKind, _progress: TransferProgress) {}

    /// The selection was resolved again. Only [`Resolution::Found`] allows
    /// provisioning; `NotFound` and `Undetermined` tell an unpublished
    /// selection from an incomplete one.
    fn resolved(&mut self, _resolution: &Resolution) {}

    /// Whether user actions should currently be accepted.
    fn controls(&mut self, _enabled: bool) {}

    /// A session was opened (`Some(name)`) or closed (`None`).
    fn connection(&mut self, _name: Option<&str>) {}

    /// Human readable status line.
    fn message(&mut self, _message: &str) {}

    fn failed(&mut self, _error: &ProvisionError) {}
}

/// An observer that ignores everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopObserver;
impl Observer for NoopObserver {}
