//! Scripted serial backend for testing the pipeline without hardware.
//!
//! Each successful `open` consumes the next scripted session; each
//! `read_chunk` on that session consumes the next step.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::connection::ConnectError;
use super::traits::{SerialBackend, SerialStream};
use crate::config::PortConfig;

/// Upper bound on how long an exhausted script pretends to wait for data.
const EXHAUSTED_WAIT: Duration = Duration::from_millis(5);

/// One scripted read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    /// Bytes delivered by the device. Longer than the read buffer is split
    /// across consecutive reads.
    Data(Vec<u8>),
    /// The read timed out with no data.
    Idle,
    /// The device failed mid-read.
    Fail(io::ErrorKind),
}

impl MockStep {
    pub fn data(bytes: &[u8]) -> Self {
        MockStep::Data(bytes.to_vec())
    }
}

/// In-memory serial backend.
#[derive(Debug, Default)]
pub struct MockSerial {
    open_failures: VecDeque<ConnectError>,
    sessions: VecDeque<Vec<MockStep>>,
    open_attempts: usize,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` open attempts fail with `error`.
    pub fn fail_opens(mut self, count: usize, error: ConnectError) -> Self {
        for _ in 0..count {
            self.open_failures.push_back(error.clone());
        }
        self
    }

    /// Appends a session served by the next successful open.
    pub fn session(mut self, steps: Vec<MockStep>) -> Self {
        self.sessions.push_back(steps);
        self
    }

    /// Number of `open` calls so far, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts
    }

    /// Sessions not yet consumed by an open.
    pub fn remaining_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl SerialBackend for MockSerial {
    type Stream = MockPort;

    fn open(&mut self, _config: &PortConfig) -> Result<MockPort, ConnectError> {
        self.open_attempts += 1;
        if let Some(error) = self.open_failures.pop_front() {
            return Err(error);
        }
        let steps = self.sessions.pop_front().unwrap_or_default();
        Ok(MockPort {
            steps: steps.into(),
        })
    }
}

/// Stream handed out by `MockSerial`.
#[derive(Debug)]
pub struct MockPort {
    steps: VecDeque<MockStep>,
}

impl SerialStream for MockPort {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(MockStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.steps.push_front(MockStep::Data(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(MockStep::Idle) => Ok(0),
            Some(MockStep::Fail(kind)) => Err(io::Error::new(kind, "mock serial failure")),
            None => {
                std::thread::sleep(timeout.min(EXHAUSTED_WAIT));
                Ok(0)
            }
        }
    }
}
