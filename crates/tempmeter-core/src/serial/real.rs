//! Hardware backend built on the `serialport` crate.

use std::io::{self, Read};
use std::time::Duration;

use tracing::debug;

use super::connection::ConnectError;
use super::traits::{SerialBackend, SerialStream};
use crate::config::{DataBits, FlowControl, Parity, PortConfig, StopBits};

/// Opens real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSerial;

impl RealSerial {
    pub fn new() -> Self {
        Self
    }
}

impl SerialBackend for RealSerial {
    type Stream = RealPort;

    fn open(&mut self, config: &PortConfig) -> Result<RealPort, ConnectError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .parity(match config.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .data_bits(match config.data_bits {
                DataBits::Five => serialport::DataBits::Five,
                DataBits::Six => serialport::DataBits::Six,
                DataBits::Seven => serialport::DataBits::Seven,
                DataBits::Eight => serialport::DataBits::Eight,
            })
            .stop_bits(match config.stop_bits {
                StopBits::One => serialport::StopBits::One,
                StopBits::Two => serialport::StopBits::Two,
            })
            .flow_control(match config.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::Software => serialport::FlowControl::Software,
                FlowControl::Hardware => serialport::FlowControl::Hardware,
            })
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| classify_open_error(&config.port, e))?;

        Ok(RealPort {
            port,
            timeout: config.read_timeout,
        })
    }
}

/// An open hardware port.
pub struct RealPort {
    port: Box<dyn serialport::SerialPort>,
    /// Timeout currently programmed into the driver.
    timeout: Duration,
}

impl SerialStream for RealPort {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(io::Error::from)?;
            self.timeout = timeout;
        }

        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

fn classify_open_error(port: &str, e: serialport::Error) -> ConnectError {
    let detail = format!("{}: {}", port, e.description);
    debug!(port, kind = ?e.kind, "serial open failed");

    match e.kind {
        serialport::ErrorKind::NoDevice => ConnectError::NotFound(detail),
        serialport::ErrorKind::InvalidInput => ConnectError::InvalidConfig(detail),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => ConnectError::NotFound(detail),
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            ConnectError::PermissionDenied(detail)
        }
        _ if e.description.to_ascii_lowercase().contains("busy") => ConnectError::Busy(detail),
        _ => ConnectError::Other(detail),
    }
}

/// Lists serial ports visible to the OS as `(name, description)` pairs.
pub fn list_ports() -> Result<Vec<(String, String)>, ConnectError> {
    let ports = serialport::available_ports().map_err(|e| ConnectError::Other(e.description))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => format!(
                    "USB {:04x}:{:04x} {}",
                    info.vid,
                    info.pid,
                    info.product.unwrap_or_default()
                ),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                _ => "unknown".to_string(),
            };
            (p.port_name, description)
        })
        .collect())
}
