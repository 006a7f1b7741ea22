use std::fmt;
use std::io;
use std::time::Duration;

use tracing::{debug, info};

use super::traits::{SerialBackend, SerialStream};
use crate::config::PortConfig;

/// Why a port could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The port does not exist (device unplugged or wrong name).
    NotFound(String),
    /// The process may not open the port.
    PermissionDenied(String),
    /// Another process holds the port.
    Busy(String),
    /// The driver rejected the line settings.
    InvalidConfig(String),
    Other(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::NotFound(msg) => write!(f, "port not found: {}", msg),
            ConnectError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            ConnectError::Busy(msg) => write!(f, "device busy: {}", msg),
            ConnectError::InvalidConfig(msg) => write!(f, "invalid port settings: {}", msg),
            ConnectError::Other(msg) => write!(f, "cannot open port: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Failure while reading from an open (or supposedly open) port.
#[derive(Debug)]
pub enum IoError {
    /// `read_chunk` was called without an open handle.
    NotConnected,
    /// The device failed mid-read; the connection is dead.
    Io(io::Error),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::NotConnected => write!(f, "port is not open"),
            IoError::Io(e) => write!(f, "serial I/O error: {}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        IoError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last open or read failed; the handle (if any) must be closed.
    Faulted,
}

/// Owns the single serial handle and tracks its liveness.
pub struct PortConnection<B: SerialBackend> {
    backend: B,
    config: PortConfig,
    stream: Option<B::Stream>,
    state: ConnectionState,
    buf: Vec<u8>,
}

impl<B: SerialBackend> PortConnection<B> {
    pub fn new(backend: B, config: PortConfig) -> Self {
        let buf = vec![0u8; config.chunk_size.max(1)];
        Self {
            backend,
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            buf,
        }
    }

    /// Opens the port, closing any previous handle first.
    pub fn open(&mut self) -> Result<(), ConnectError> {
        if self.stream.is_some() {
            self.close();
        }

        self.state = ConnectionState::Connecting;
        debug!(port = %self.config.port, "opening serial port");

        match self.backend.open(&self.config) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                info!(
                    port = %self.config.port,
                    baud = self.config.baud_rate,
                    "serial port opened"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Faulted;
                Err(e)
            }
        }
    }

    /// Reads the next chunk of bytes, waiting at most `timeout`.
    ///
    /// An empty slice means the timeout elapsed without data. On error the
    /// connection is marked `Faulted`.
    pub fn read_chunk(&mut self, timeout: Duration) -> Result<&[u8], IoError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(IoError::NotConnected);
        };

        match stream.read_chunk(&mut self.buf, timeout) {
            Ok(n) => Ok(&self.buf[..n.min(self.buf.len())]),
            Err(e) => {
                self.state = ConnectionState::Faulted;
                Err(IoError::Io(e))
            }
        }
    }

    /// Releases the handle. Safe to call when already closed.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(port = %self.config.port, "serial port closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
