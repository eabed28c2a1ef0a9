//! Command front of the provisioning pipeline.
//!
//! The [`Orchestrator`] owns everything the pipeline works with: the settings,
//! the manifest, the current selection and its descriptor, the session slot,
//! the bootloader capability and the collaborators it reports to. The user
//! interface only sends [`Command`]s and listens to the [`Observer`].
//!
//! **Example**
//! ```no_run
//! use flashcom::{
//!     AutoConfirm, BootloaderCapability, Command, Manifest, NoopObserver, Orchestrator,
//!     SelectionKey, SerialAuthority, SettingsBuilder,
//! };
//!
//! let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
//! let mut orchestrator = Orchestrator::new(
//!     settings,
//!     Box::new(SerialAuthority),
//!     BootloaderCapability::Unavailable,
//!     Box::new(AutoConfirm(true)),
//!     Box::new(NoopObserver),
//! );
//! orchestrator.dispatch(Command::LoadManifest(Manifest::load("manifest.json"))).unwrap();
//! orchestrator
//!     .dispatch(Command::Select(
//!         SelectionKey::new("chatbot", "ESP32-S3-M16R8", "OLED-1.3").into(),
//!     ))
//!     .unwrap();
//! orchestrator.dispatch(Command::Connect).unwrap();
//! let response = orchestrator.dispatch(Command::Provision);
//! println!("{:?}", response);
//! ```

use log::{debug, info, warn};

use crate::bootloader::BootloaderCapability;
use crate::error::ProvisionError;
use crate::manifest::{resolve_selection, FirmwareDescriptor, Manifest, Resolution, Selection};
use crate::provision::{self, Confirmation, Context, Observer, ProvisionReport};
use crate::transport::{PortAuthority, TransportSession};
use crate::Settings;

// =============================================================================
// Public Interface
// =============================================================================

/// Requests the user interface can make.
#[derive(Debug)]
pub enum Command {
    /// Replace the manifest and resolve the current selection again.
    LoadManifest(Manifest),
    /// Replace the selection and resolve it.
    Select(Selection),
    /// Open a session, replacing the current one after confirmation.
    Connect,
    /// Close the session, if any.
    Disconnect,
    /// Flash the firmware resolved for the current selection.
    Provision,
}

/// Result of a successfully handled [`Command`].
#[derive(Debug)]
pub enum Response {
    /// The selection was resolved again.
    Resolved(Resolution),
    /// A session is open on the named port.
    Connected(String),
    /// The session was closed, or there was none.
    Disconnected,
    /// The user declined to replace the open session.
    Unchanged,
    Provisioned(ProvisionReport),
}

pub struct Orchestrator {
    settings: Settings,
    manifest: Manifest,
    selection: Selection,
    resolution: Resolution,
    session: Option<TransportSession>,
    authority: Box<dyn PortAuthority>,
    bootloader: BootloaderCapability,
    confirmation: Box<dyn Confirmation>,
    observer: Box<dyn Observer>,
}
impl Orchestrator {
    /// Build an orchestrator with an empty manifest and no selection. The
    /// bootloader capability is decided here, once.
    pub fn new(
        settings: Settings,
        authority: Box<dyn PortAuthority>,
        bootloader: BootloaderCapability,
        confirmation: Box<dyn Confirmation>,
        observer: Box<dyn Observer>,
    ) -> Self {
        info!("bootloader protocol: {:?}", bootloader);
        Orchestrator {
            settings,
            manifest: Manifest::new(),
            selection: Selection::default(),
            resolution: Resolution::Undetermined,
            session: None,
            authority,
            bootloader,
            confirmation,
            observer,
        }
    }

    /// Handle one command. Whatever happens, user controls are enabled again
    /// when this returns; errors have already been reported to the observer.
    pub fn dispatch(&mut self, command: Command) -> Result<Response, ProvisionError> {
        debug!("command: {:?}", command);
        match command {
            Command::LoadManifest(manifest) => {
                self.manifest = manifest;
                Ok(Response::Resolved(self.resolve()))
            }
            Command::Select(selection) => {
                self.selection = selection;
                Ok(Response::Resolved(self.resolve()))
            }
            Command::Connect => self.connect(),
            Command::Disconnect => {
                self.disconnect();
                Ok(Response::Disconnected)
            }
            Command::Provision => self.provision().map(Response::Provisioned),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The descriptor resolved for the current selection, if any. Provisioning
    /// is only possible when there is one.
    pub fn descriptor(&self) -> Option<&FirmwareDescriptor> {
        self.resolution.descriptor()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().map_or(false, TransportSession::is_open)
    }

    // -------------------------------------------------------------------------
    // Command handlers
    // -------------------------------------------------------------------------

    fn resolve(&mut self) -> Resolution {
        self.resolution = resolve_selection(&self.selection, &self.manifest);
        match &self.resolution {
            Resolution::Found(descriptor) => {
                info!("firmware {} available for selection", descriptor.version)
            }
            Resolution::NotFound => info!("no firmware published for selection"),
            Resolution::Undetermined => debug!("selection incomplete"),
        }
        self.observer.resolved(&self.resolution);
        self.resolution.clone()
    }

    fn connect(&mut self) -> Result<Response, ProvisionError> {
        if let Some(current) = self.session.as_ref().filter(|s| s.is_open()) {
            let prompt = format!(
                "Close the connection on {} and connect again?",
                current.name()
            );
            if !self.confirmation.confirm(&prompt) {
                return Ok(Response::Unchanged);
            }
        }
        self.disconnect();

        self.observer.controls(false);
        let result = TransportSession::open(&mut *self.authority, &self.settings);
        self.observer.controls(true);

        match result {
            Ok(session) => {
                let name = session.name().to_owned();
                self.observer.connection(Some(&name));
                self.session = Some(session);
                Ok(Response::Connected(name))
            }
            Err(e) => {
                let error = ProvisionError::from(e);
                warn!("could not connect: {}", error);
                self.observer.failed(&error);
                Err(error)
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            self.observer.connection(None);
        }
    }

    fn provision(&mut self) -> Result<ProvisionReport, ProvisionError> {
        self.observer.controls(false);
        let outcome = {
            let mut ctx = Context {
                settings: &self.settings,
                manifest: &self.manifest,
                selection: &self.selection,
                session: self.session.as_mut(),
                bootloader: &mut self.bootloader,
                confirmation: &mut *self.confirmation,
                observer: &mut *self.observer,
            };
            provision::provision(&mut ctx)
        };
        self.observer.controls(true);
        outcome
    }
}
