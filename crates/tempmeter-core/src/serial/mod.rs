//! Serial device access.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                PortConnection                │
//! │  - ConnectionState                           │
//! │  - read buffer (chunk_size)                  │
//! │              ┌────────▼────────┐             │
//! │              │ SerialBackend   │ (trait)     │
//! │              └────────┬────────┘             │
//! └───────────────────────┼──────────────────────┘
//!               ┌─────────┴─────────┐
//!        ┌──────▼──────┐     ┌──────▼──────┐
//!        │ RealSerial  │     │ MockSerial  │
//!        │ (serialport)│     │ (scripted)  │
//!        └─────────────┘     └─────────────┘
//! ```
//!
//! ## Testing (with MockSerial)
//!
//! ```
//! use std::time::Duration;
//! use tempmeter_core::config::PortConfig;
//! use tempmeter_core::serial::{MockSerial, MockStep, PortConnection};
//!
//! let backend = MockSerial::new().session(vec![MockStep::data(b"21.5\n")]);
//! let mut conn = PortConnection::new(backend, PortConfig::default());
//! conn.open().unwrap();
//! let chunk = conn.read_chunk(Duration::from_millis(10)).unwrap();
//! assert_eq!(chunk, b"21.5\n");
//! ```

mod connection;
pub mod mock;
mod real;
pub mod traits;

pub use connection::{ConnectError, ConnectionState, IoError, PortConnection};
pub use mock::{MockSerial, MockStep};
pub use real::{RealSerial, list_ports};
pub use traits::{SerialBackend, SerialStream};
