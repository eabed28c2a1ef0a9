//! Serial port selection and opening.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Select};
use log::{debug, info};
use serialport::{SerialPort, SerialPortType};

use crate::error::TransportError;
use crate::Settings;

/// Read timeout of an opened port. Keeps the background reader responsive to
/// cancellation.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

//==============================================================================
// Public Interface
//==============================================================================

/// A byte-stream connection to the device.
///
/// Implemented by [`SerialLink`] for real hardware; tests and embedders can
/// supply their own.
pub trait Port: Read + Write + Send {
    /// Human readable name of the port, usually the device path.
    fn name(&self) -> Option<String>;

    /// Drive the DTR and RTS modem control lines. Ports without control
    /// lines return an [`io::ErrorKind::Unsupported`] error.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// A second handle on the same connection, used by the background reader.
    fn try_clone_port(&self) -> io::Result<Box<dyn Port>>;
}

/// Decides which port the user authorized and opens it.
pub trait PortAuthority {
    /// Fails with [`TransportError::Connection`] when the host has no usable
    /// port, [`TransportError::Cancelled`] when the user declines to choose
    /// one, and [`TransportError::Open`] when the device refuses the
    /// configuration.
    fn request(&mut self, settings: &Settings) -> Result<Box<dyn Port>, TransportError>;
}

/// A [`Port`] backed by a `serialport` device.
pub struct SerialLink(Box<dyn SerialPort>);
impl SerialLink {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialLink(port)
    }
}
impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}
impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
impl Port for SerialLink {
    fn name(&self) -> Option<String> {
        self.0.name()
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.0.write_data_terminal_ready(dtr)?;
        self.0.write_request_to_send(rts)?;
        Ok(())
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn Port>> {
        let clone = self.0.try_clone()?;
        Ok(Box::new(SerialLink(clone)))
    }
}
impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.0.name())
            .field("baud_rate", &self.0.baud_rate().ok())
            .field("data_bits", &self.0.data_bits().ok())
            .field("parity", &self.0.parity().ok())
            .finish()
    }
}

/// The interactive [`PortAuthority`]: uses the port from the settings when
/// there is one, otherwise lets the user pick among the detected ports.
#[derive(Debug, Default, Copy, Clone)]
pub struct SerialAuthority;
impl PortAuthority for SerialAuthority {
    fn request(&mut self, settings: &Settings) -> Result<Box<dyn Port>, TransportError> {
        let path = match &settings.path {
            Some(path) => path.clone(),
            None => {
                let ports = available_ports()?;
                select_port_interactive(&ports).ok_or(TransportError::Cancelled)?
            }
        };
        let port = open_and_setup_port(&path, settings)?;
        Ok(Box::new(SerialLink::new(port)))
    }
}

/// Enumerate the serial devices on the system, with the USB manufacturer and
/// product appended when known.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    let ports =
        serialport::available_ports().map_err(|e| TransportError::Connection(e.to_string()))?;
    if ports.is_empty() {
        return Err(TransportError::Connection(
            "no serial device is connected".into(),
        ));
    }

    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            // USB ports give us more info about the connected serial
            // controller
            SerialPortType::UsbPort(info) => format!(
                "{}: ({} / {})",
                p.port_name,
                info.manufacturer.as_ref().map_or("", String::as_str),
                info.product.as_ref().map_or("", String::as_str)
            ),
            _ => p.port_name,
        })
        .collect())
}

//==============================================================================
// Private stuff
//==============================================================================

fn select_port_interactive(ports: &[String]) -> Option<String> {
    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();

    let mut select = Select::with_theme(&theme);
    select.with_prompt(format!(
        "Select the device port (`{}` to cancel)",
        style("Esc").cyan()
    ));
    for item in ports {
        select.item(item);
    }

    match select.default(0).interact_on_opt(&term) {
        Ok(Some(index)) => ports
            .get(index)
            .and_then(|item| item.split(':').next())
            .map(String::from),
        Ok(None) => {
            debug!("user did not select any port");
            None
        }
        Err(ref e) => {
            info!("error: {}", e);
            None
        }
    }
}

fn open_and_setup_port(
    path: &str,
    settings: &Settings,
) -> Result<Box<dyn SerialPort>, TransportError> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(settings.open_retries.saturating_sub(1)),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to connect {}", index);
            serialport::new(path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .timeout(READ_TIMEOUT)
                .open()
        },
    );

    let refused = |reason: String| TransportError::Open {
        path: path.to_owned(),
        reason,
    };

    match result {
        Ok(port) => {
            let baud_rate = port.baud_rate().map_err(|e| refused(e.to_string()))?;
            if baud_rate != settings.baud_rate {
                return Err(refused(format!(
                    "the device does not accept {} baud (got {})",
                    settings.baud_rate, baud_rate
                )));
            }
            info!("Connected to {} at {} baud", path, baud_rate);
            debug!("data_bits    : {:#?}", port.data_bits());
            debug!("stop_bits    : {:#?}", port.stop_bits());
            debug!("parity       : {:#?}", port.parity());
            debug!("flow control : {:#?}", port.flow_control());
            Ok(port)
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            info!(
                "Failed to open the port after {:?} and {} tries: {}",
                total_delay, tries, error,
            );
            Err(refused(error.to_string()))
        }
        Err(retry::Error::Internal(reason)) => {
            info!("Internal retry error while opening port");
            Err(refused(reason))
        }
    }
}
