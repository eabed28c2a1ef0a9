//! Events for the `flashcom` provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use crate::error::ProvisionError;
use crate::image::FirmwareImage;
use crate::manifest::FirmwareDescriptor;

use super::ProvisionReport;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// ResolveEvent ================================================================

/// Event fired from the `Idle` state to start resolving the selection.
#[derive(Debug)]
pub(crate) struct ResolveEvent {}

// FetchEvent ==================================================================

/// Event fired once a descriptor was found and every precondition (open
/// session, user confirmation) holds. Triggers the transition to `Fetching`.
#[derive(Debug)]
pub(crate) struct FetchEvent {
    pub descriptor: FirmwareDescriptor,
}

// VerifyEvent =================================================================

/// Event fired when every part of the image has been retrieved.
#[derive(Debug)]
pub(crate) struct VerifyEvent {
    pub descriptor: FirmwareDescriptor,
    pub image: FirmwareImage,
}

// TransferEvent ===============================================================

/// Event fired when the image has been verified, carrying the digests computed
/// during verification so they are never computed twice.
#[derive(Debug)]
pub(crate) struct TransferEvent {
    pub descriptor: FirmwareDescriptor,
    pub image: FirmwareImage,
    pub digests: Vec<String>,
}

// CompleteEvent ===============================================================

/// Event fired when every byte of the image has been handed to the device.
#[derive(Debug)]
pub(crate) struct CompleteEvent {
    pub report: ProvisionReport,
}

// FailEvent ===================================================================

/// Event fired from any non-terminal state when the operation cannot go on.
#[derive(Debug)]
pub(crate) struct FailEvent {
    pub error: ProvisionError,
}

// ExitEvent ===================================================================

/// The last event of an operation, fired by `Completed` or `Failed` once they
/// have reported the outcome. The outcome is handed back to the caller.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub outcome: Result<ProvisionReport, ProvisionError>,
}

// Events enum ==================================================================

/// Events that can be triggered within the provisioning state machine.
///
/// Each event moves the data the next state needs out of the state that fired
/// it.
#[derive(Debug)]
pub(crate) enum Event {
    Resolve(ResolveEvent),
    Fetch(FetchEvent),
    Verify(VerifyEvent),
    Transfer(TransferEvent),
    Complete(CompleteEvent),
    Fail(FailEvent),
    Exit(ExitEvent),
}
impl From<ProvisionError> for Event {
    fn from(error: ProvisionError) -> Self {
        Event::Fail(FailEvent { error })
    }
}
