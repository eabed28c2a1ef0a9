//! `flashcom` provisioning state machine.
//!
//! A provisioning operation runs to completion in one call; the states are
//! never left half-way. `Failed` can be reached from any non-terminal state.
//!
//! ```text
//!                START
//!                  |
//!                  v
//!              .-------.
//!              | Idle  |
//!              '-------'
//!                  |
//!                  v
//!       .---------------------.  selection incomplete,
//!       | ResolvingDescriptor |--no firmware, no session,---.
//!       '---------------------'  not confirmed              |
//!                  |                                         |
//!                  v                                         |
//!             .----------.                                   |
//!             | Fetching |-------- fetch error ------------->|
//!             '----------'                                   |
//!                  |                                         |
//!                  v                                         |
//!            .-----------.                                   |
//!            | Verifying |------- digest enforced ---------->|
//!            '-----------'        and mismatched             |
//!                  |                                         v
//!                  v                                    .--------.
//!          .--------------.                             | Failed |
//!          | Transferring |--- raw path failed -------->'--------'
//!          '--------------'                                  |
//!                  |                                         |
//!                  v                                         |
//!            .-----------.                                   |
//!            | Completed |                                   |
//!            '-----------'                                   |
//!                  |                                         |
//!                  '-------------->  Done  <-----------------'
//!                                     |
//!                                     v
//!                                    END
//! ```
//!
//! Within `Transferring`, the structured path is tried first when a bootloader
//! protocol is available; if it fails, the raw path is tried once with the
//! same image.

use crate::bootloader::BootloaderCapability;
use crate::error::ProvisionError;
use crate::manifest::{Manifest, Selection};
use crate::transport::TransportSession;
use crate::Settings;

use super::events::*;
use super::states::*;
use super::{Confirmation, Observer, ProvisionReport};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Everything a provisioning operation works with, lent by the
/// [`Orchestrator`](crate::Orchestrator) for the duration of the operation.
pub(crate) struct Context<'a> {
    pub settings: &'a Settings,
    pub manifest: &'a Manifest,
    pub selection: &'a Selection,
    pub session: Option<&'a mut TransportSession>,
    pub bootloader: &'a mut BootloaderCapability,
    pub confirmation: &'a mut dyn Confirmation,
    pub observer: &'a mut dyn Observer,
}

/// Run one provisioning operation from `Idle` until it is `Done`.
pub(crate) fn provision(ctx: &mut Context<'_>) -> Result<ProvisionReport, ProvisionError> {
    let mut sm = ProvisionStates::Idle(IdleState {});
    loop {
        sm = match sm.step(ctx) {
            ProvisionStates::Done(done) => return done.outcome,
            next => next,
        };
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// An enum wrapper around the states of the provisioning state machine,
/// used for pattern matching during state transitions.
#[derive(Debug)]
enum ProvisionStates {
    Idle(IdleState),
    Resolving(ResolvingState),
    Fetching(FetchingState),
    Verifying(VerifyingState),
    Transferring(TransferringState),
    Completed(CompletedState),
    Failed(FailedState),
    Done(DoneState),
}
impl ProvisionStates {
    /// The unit of work in the state machine loop. It runs the current state,
    /// which is consumed, and turns the resulting event into the next state.
    /// Transitions are implemented with `From`/`Into`, so an event can only
    /// lead to the states it has a conversion for.
    fn step(self, ctx: &mut Context<'_>) -> Self {
        match self {
            ProvisionStates::Idle(state) => match state.run(ctx) {
                Event::Resolve(ev) => ProvisionStates::Resolving(ev.into()),
                Event::Fail(ev) => ProvisionStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at Idle", event),
            },
            ProvisionStates::Resolving(state) => match state.run(ctx) {
                Event::Fetch(ev) => ProvisionStates::Fetching(ev.into()),
                Event::Fail(ev) => ProvisionStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at ResolvingDescriptor", event),
            },
            ProvisionStates::Fetching(state) => match state.run(ctx) {
                Event::Verify(ev) => ProvisionStates::Verifying(ev.into()),
                Event::Fail(ev) => ProvisionStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at Fetching", event),
            },
            ProvisionStates::Verifying(state) => match state.run(ctx) {
                Event::Transfer(ev) => ProvisionStates::Transferring(ev.into()),
                Event::Fail(ev) => ProvisionStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at Verifying", event),
            },
            ProvisionStates::Transferring(state) => match state.run(ctx) {
                Event::Complete(ev) => ProvisionStates::Completed(ev.into()),
                Event::Fail(ev) => ProvisionStates::Failed(ev.into()),
                event => unreachable!("illegal event {:#?} at Transferring", event),
            },
            ProvisionStates::Completed(state) => match state.run(ctx) {
                Event::Exit(ev) => ProvisionStates::Done(ev.into()),
                event => unreachable!("illegal event {:#?} at Completed", event),
            },
            ProvisionStates::Failed(state) => match state.run(ctx) {
                Event::Exit(ev) => ProvisionStates::Done(ev.into()),
                event => unreachable!("illegal event {:#?} at Failed", event),
            },
            ProvisionStates::Done(state) => ProvisionStates::Done(state),
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<ResolveEvent> for ResolvingState {
    fn from(_: ResolveEvent) -> ResolvingState {
        ResolvingState {}
    }
}

impl From<FetchEvent> for FetchingState {
    fn from(event: FetchEvent) -> FetchingState {
        FetchingState {
            descriptor: event.descriptor,
        }
    }
}

impl From<VerifyEvent> for VerifyingState {
    fn from(event: VerifyEvent) -> VerifyingState {
        VerifyingState {
            descriptor: event.descriptor,
            image: event.image,
        }
    }
}

impl From<TransferEvent> for TransferringState {
    fn from(event: TransferEvent) -> TransferringState {
        TransferringState {
            descriptor: event.descriptor,
            image: event.image,
            digests: event.digests,
        }
    }
}

impl From<CompleteEvent> for CompletedState {
    fn from(event: CompleteEvent) -> CompletedState {
        CompletedState {
            report: event.report,
        }
    }
}

impl From<FailEvent> for FailedState {
    fn from(event: FailEvent) -> FailedState {
        FailedState { error: event.error }
    }
}

impl From<ExitEvent> for DoneState {
    fn from(event: ExitEvent) -> DoneState {
        DoneState {
            outcome: event.outcome,
        }
    }
}
