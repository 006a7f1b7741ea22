//! Abstractions over the serial device so the ingestion loop can run against
//! real hardware or a scripted mock.

use std::io;
use std::time::Duration;

use super::connection::ConnectError;
use crate::config::PortConfig;

/// An open serial stream.
pub trait SerialStream: Send {
    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// A timeout with no data is `Ok(0)`, not an error. Any `Err` means the
    /// stream is dead and must be reopened.
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Opens serial streams.
pub trait SerialBackend: Send {
    type Stream: SerialStream;

    /// Opens and configures the port described by `config`.
    fn open(&mut self, config: &PortConfig) -> Result<Self::Stream, ConnectError>;
}
