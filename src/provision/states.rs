//! States for the `flashcom` provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use log::{debug, error, info, warn};

use crate::bootloader::BootloaderCapability;
use crate::digest;
use crate::error::{FetchError, ProvisionError};
use crate::fetch;
use crate::image::{FirmwareImage, FlashSegment};
use crate::manifest::{resolve_selection, FirmwareDescriptor, FirmwareLayout, Resolution};
use crate::progress::TransferProgress;
use crate::Settings;

use super::events::*;
use super::state_machine::Context;
use super::transfer;
use super::{Observer, Phase, ProgressKind, ProvisionReport, Strategy};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// The state does its work and requests a transition by returning the
    /// appropriate `event`. The `state` is consumed and the `event` is turned
    /// into the `new state` using the corresponding [`From`] trait
    /// implementation (provided such implementation exists).
    fn run(self, ctx: &mut Context<'_>) -> Event;
}

fn precondition(reason: impl Into<String>) -> Event {
    Event::from(ProvisionError::Precondition(reason.into()))
}

// Idle State ==================================================================

/// The initial state, before anything was looked at.
///
///  * **[`ResolveEvent`] => [`ResolvingState`]** always.
#[derive(Debug)]
pub(crate) struct IdleState {}
impl Runnable for IdleState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Idle");
        ctx.observer.phase(Phase::Idle);
        Event::Resolve(ResolveEvent {})
    }
}

// ResolvingDescriptor State ===================================================

/// Resolves the selection and checks that the operation may start: firmware is
/// published for the selection, a session is open and the user confirmed.
///
///  * **[`FetchEvent`] => [`FetchingState`]** when every precondition holds,
///  * **[`FailEvent`] => [`FailedState`]** with a precondition error
///    otherwise. No byte has been moved at that point.
#[derive(Debug)]
pub(crate) struct ResolvingState {}
impl Runnable for ResolvingState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> ResolvingDescriptor");
        ctx.observer.phase(Phase::ResolvingDescriptor);

        let descriptor = match resolve_selection(ctx.selection, ctx.manifest) {
            Resolution::Found(descriptor) => descriptor,
            Resolution::NotFound => {
                return precondition("no firmware is published for this selection")
            }
            Resolution::Undetermined => {
                return precondition("select a variant, a hardware revision and a display module")
            }
        };
        debug!("resolved firmware {}: {:?}", descriptor.version, descriptor.layout);

        let port_name = match ctx.session.as_deref() {
            Some(session) if session.is_open() => session.name().to_owned(),
            _ => return precondition("connect to the device first"),
        };

        let prompt = format!(
            "Flash firmware {} to the device on {}? This overwrites the current firmware.",
            descriptor.version, port_name
        );
        if !ctx.confirmation.confirm(&prompt) {
            return precondition("flashing was not confirmed");
        }

        Event::Fetch(FetchEvent { descriptor })
    }
}

// Fetching State ==============================================================

/// Retrieves every part of the firmware, reporting download progress.
///
///  * **[`VerifyEvent`] => [`VerifyingState`]** with the whole image,
///  * **[`FailEvent`] => [`FailedState`]** on any retrieval error.
#[derive(Debug)]
pub(crate) struct FetchingState {
    pub descriptor: FirmwareDescriptor,
}
impl Runnable for FetchingState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Fetching");
        ctx.observer.phase(Phase::Fetching);

        match fetch_image(&self.descriptor, ctx.settings, &mut *ctx.observer) {
            Ok(image) => {
                info!(
                    "fetched {} bytes in {} segment(s)",
                    image.len(),
                    image.segments().len()
                );
                Event::Verify(VerifyEvent {
                    descriptor: self.descriptor,
                    image,
                })
            }
            Err(e) => Event::from(ProvisionError::from(e)),
        }
    }
}

fn fetch_image(
    descriptor: &FirmwareDescriptor,
    settings: &Settings,
    observer: &mut dyn Observer,
) -> Result<FirmwareImage, FetchError> {
    let mut report = |progress: TransferProgress| observer.progress(ProgressKind::Download, progress);

    let segments = match &descriptor.layout {
        FirmwareLayout::Single { source, address } => vec![FlashSegment {
            address: address.unwrap_or(settings.default_flash_address),
            data: fetch::fetch_location(source, &mut report)?,
        }],
        FirmwareLayout::MultiPart(parts) => {
            let mut segments = Vec::with_capacity(parts.len());
            for part in parts {
                segments.push(FlashSegment {
                    address: part.address,
                    data: fetch::fetch(&part.source, &mut report)?,
                });
            }
            segments
        }
    };
    Ok(FirmwareImage::new(segments))
}

// Verifying State =============================================================

/// Computes the digest of every fetched segment, exactly once, and compares
/// the image with the advisory size and digest of the descriptor.
///
///  * **[`TransferEvent`] => [`TransferringState`]** normally,
///  * **[`FailEvent`] => [`FailedState`]** only when digests are enforced and
///    the digest differs.
#[derive(Debug)]
pub(crate) struct VerifyingState {
    pub descriptor: FirmwareDescriptor,
    pub image: FirmwareImage,
}
impl Runnable for VerifyingState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Verifying");
        ctx.observer.phase(Phase::Verifying);

        let digests: Vec<String> = self
            .image
            .segments()
            .iter()
            .map(|segment| digest::digest(&segment.data))
            .collect();
        for (segment, digest) in self.image.segments().iter().zip(&digests) {
            info!(
                "{:#08x}: {} bytes, sha256 {}",
                segment.address,
                segment.data.len(),
                digest
            );
        }

        if let Some(size) = self.descriptor.size {
            if size != self.image.len() {
                warn!(
                    "manifest announces {} bytes but {} were fetched",
                    size,
                    self.image.len()
                );
            }
        }

        match (&self.descriptor.digest, digests.as_slice()) {
            (Some(expected), [actual]) => {
                if digest::matches(actual, expected) {
                    ctx.observer.message(&format!("SHA-256 verified: {}", actual));
                } else if ctx.settings.enforce_digest {
                    return Event::from(ProvisionError::Integrity {
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                } else {
                    warn!(
                        "image digest {} differs from the manifest ({})",
                        actual, expected
                    );
                    ctx.observer
                        .message(&format!("SHA-256 {} does not match the manifest", actual));
                }
            }
            (Some(_), _) => debug!("manifest digest not compared for a multi-part image"),
            (None, [actual]) => ctx.observer.message(&format!("SHA-256: {}", actual)),
            (None, _) => {}
        }

        Event::Transfer(TransferEvent {
            descriptor: self.descriptor,
            image: self.image,
            digests,
        })
    }
}

// Transferring State ==========================================================

/// Writes the image to the device: through the bootloader protocol when one
/// is available, falling back once to the raw stream if that fails; directly
/// through the raw stream otherwise.
///
///  * **[`CompleteEvent`] => [`CompletedState`]** once all bytes are written,
///  * **[`FailEvent`] => [`FailedState`]** when the raw stream fails.
#[derive(Debug)]
pub(crate) struct TransferringState {
    pub descriptor: FirmwareDescriptor,
    pub image: FirmwareImage,
    pub digests: Vec<String>,
}
impl Runnable for TransferringState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Transferring");
        ctx.observer.phase(Phase::Transferring);

        let session = match ctx.session.as_deref_mut() {
            Some(session) if session.is_open() => session,
            _ => return precondition("connect to the device first"),
        };

        let mut strategy = Strategy::Raw;
        let mut fell_back = false;

        if let BootloaderCapability::Available(protocol) = &mut *ctx.bootloader {
            match transfer::structured(session, &mut **protocol, &self.image, &mut *ctx.observer) {
                Ok(()) => strategy = Strategy::Structured,
                Err(e) => {
                    warn!("bootloader transfer failed, trying the raw stream: {}", e);
                    ctx.observer
                        .message(&format!("Bootloader flashing failed ({}), retrying raw", e));
                    // transfer progress restarts from zero
                    ctx.observer.phase(Phase::Transferring);
                    fell_back = true;
                }
            }
        } else {
            debug!("no bootloader protocol, using the raw stream");
        }

        if strategy == Strategy::Raw {
            if let Err(e) = transfer::raw(session, &self.image, ctx.settings, &mut *ctx.observer) {
                return Event::from(e);
            }
        }

        Event::Complete(CompleteEvent {
            report: ProvisionReport {
                version: self.descriptor.version,
                bytes: self.image.len(),
                digests: self.digests,
                strategy,
                fell_back,
            },
        })
    }
}

// Completed State =============================================================

/// Reports success and ends the operation.
///
///  * **[`ExitEvent`] => [`DoneState`]**.
#[derive(Debug)]
pub(crate) struct CompletedState {
    pub report: ProvisionReport,
}
impl Runnable for CompletedState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Completed");
        ctx.observer.progress(
            ProgressKind::Transfer,
            TransferProgress::complete(self.report.bytes),
        );
        ctx.observer.phase(Phase::Completed);
        ctx.observer.message(&format!(
            "Firmware {} written ({} bytes)",
            self.report.version, self.report.bytes
        ));
        Event::Exit(ExitEvent {
            outcome: Ok(self.report),
        })
    }
}

// Failed State ================================================================

/// Reports the error and ends the operation. The session is left open so the
/// user can retry or disconnect.
///
///  * **[`ExitEvent`] => [`DoneState`]**.
#[derive(Debug)]
pub(crate) struct FailedState {
    pub error: ProvisionError,
}
impl Runnable for FailedState {
    fn run(self, ctx: &mut Context<'_>) -> Event {
        info!("=> Failed");
        error!("provisioning failed ({:?}): {}", self.error.class(), self.error);
        ctx.observer.phase(Phase::Failed);
        ctx.observer.failed(&self.error);
        Event::Exit(ExitEvent {
            outcome: Err(self.error),
        })
    }
}

// Done State ==================================================================

/// Terminal state holding the outcome handed back to the caller.
#[derive(Debug)]
pub(crate) struct DoneState {
    pub outcome: Result<ProvisionReport, ProvisionError>,
}
