//! Settings related to the serial port used by `flashcom` and to the firmware
//! provisioning policy.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

/// Flash offset used for single-image descriptors that do not specify one.
pub const DEFAULT_FLASH_ADDRESS: u32 = 0x10000;

/// Size of the slices written by the raw fallback transfer.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings related to the serial port and the provisioning policy
/// used by `flashcom` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path. When `None`, the user is asked
    /// to pick one of the detected ports.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// Location of the firmware manifest, either a `http(s)://` URL or a path
    /// on the local file system.
    pub manifest: Option<String>,
    /// Flash offset used when a single-image descriptor has no address.
    pub default_flash_address: u32,
    /// Size of each slice pushed by the raw fallback transfer.
    pub chunk_size: usize,
    /// Delay observed after each raw slice so that the USB bridge does not
    /// overflow its buffers.
    pub pacing: Duration,
    /// Settling delay between control line transitions when resetting the
    /// device into its bootloader.
    pub reset_settle: Duration,
    /// Try to reset the device into its bootloader right after opening the
    /// port.
    pub auto_reset: bool,
    /// Reject images whose digest differs from the one published in the
    /// manifest. When `false`, a mismatch is only reported as a warning.
    pub enforce_digest: bool,
    /// How many times opening the port is attempted before giving up.
    pub open_retries: usize,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use flashcom::SettingsBuilder;
///
/// let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
/// assert_eq!(settings.path.as_deref(), Some("/dev/ttyUSB0"));
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                manifest: None,
                default_flash_address: DEFAULT_FLASH_ADDRESS,
                chunk_size: DEFAULT_CHUNK_SIZE,
                pacing: Duration::from_millis(20),
                reset_settle: Duration::from_millis(50),
                auto_reset: true,
                enforce_digest: false,
                open_retries: 4,
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Set the location (URL or file path) of the firmware manifest
    pub fn manifest<'a>(mut self, manifest: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.manifest = Some(manifest.into().as_ref().to_owned());
        self
    }

    /// Set the flash offset used when a descriptor does not specify one
    pub fn default_flash_address(mut self, address: u32) -> Self {
        self.settings.default_flash_address = address;
        self
    }

    /// Set the raw fallback slice size. A size of zero is ignored.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size > 0 {
            self.settings.chunk_size = chunk_size;
        }
        self
    }

    /// Set the delay observed after each raw slice
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.settings.pacing = pacing;
        self
    }

    /// Set the control line settling delay
    pub fn reset_settle(mut self, reset_settle: Duration) -> Self {
        self.settings.reset_settle = reset_settle;
        self
    }

    /// Enable or disable the reset into bootloader after open
    pub fn auto_reset(mut self, auto_reset: bool) -> Self {
        self.settings.auto_reset = auto_reset;
        self
    }

    /// Reject images that do not match the published digest
    pub fn enforce_digest(mut self, enforce_digest: bool) -> Self {
        self.settings.enforce_digest = enforce_digest;
        self
    }

    /// Set how many attempts are made to open the port (at least one)
    pub fn open_retries(mut self, open_retries: usize) -> Self {
        self.settings.open_retries = open_retries.max(1);
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            path: None,
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            manifest: None,
            default_flash_address: 0x10000,
            chunk_size: 16384,
            pacing: Duration::from_millis(20),
            reset_settle: Duration::from_millis(50),
            auto_reset: true,
            enforce_digest: false,
            open_retries: 4,
            _private_use_builder: (),
        }
    )
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rate() {
    let baud_rate = 921_600;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn parity() {
    let parity = Parity::Even;
    let settings = SettingsBuilder::new().parity(parity).finalize();
    assert_eq!(settings.parity, parity);
}

#[test]
fn manifest() {
    let settings = SettingsBuilder::new()
        .manifest("https://example.com/firmware/manifest.json")
        .finalize();
    assert_eq!(
        settings.manifest.unwrap(),
        "https://example.com/firmware/manifest.json"
    );
}

#[test]
fn zero_chunk_size_is_ignored() {
    let settings = SettingsBuilder::new().chunk_size(0).finalize();
    assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);

    let settings = SettingsBuilder::new().chunk_size(4096).finalize();
    assert_eq!(settings.chunk_size, 4096);
}

#[test]
fn open_retries_at_least_one() {
    let settings = SettingsBuilder::new().open_retries(0).finalize();
    assert_eq!(settings.open_retries, 1);
}
