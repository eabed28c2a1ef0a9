//! `flashcom` serial transport.
//!
//! A [`TransportSession`] owns the one live connection to the device. Opening
//! it goes through a [`PortAuthority`], which decides which port the user
//! agreed to use; once open, the device is optionally reset into its
//! bootloader and a background thread starts reading whatever the device
//! prints, forwarding it line by line to the log under
//! [`DEVICE_LOG_TARGET`].
//!
//! **Example** - Opening a session on a known port:
//! ```no_run
//! use flashcom::{SerialAuthority, SettingsBuilder, TransportSession};
//!
//! let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
//! let mut session = TransportSession::open(&mut SerialAuthority, &settings).unwrap();
//! session.write(b"hello").unwrap();
//! session.close();
//! ```

mod lines;
mod port;
mod session;

pub use lines::{DeviceLines, DEVICE_LOG_TARGET};
pub use port::{available_ports, Port, PortAuthority, SerialAuthority, SerialLink};
pub use session::{SessionWriter, TransportSession};
