//! Hand-off of accepted readings to persistence.
//!
//! The sink runs on its own worker thread behind a zero-capacity channel. A
//! delivery either meets an idle worker and gets its acknowledgement before
//! the deadline, or it counts as a stall and the reading is dropped. Nothing
//! is ever queued on the ingestion side.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::reading::Reading;

#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    /// The reading could not be serialized for storage.
    Encode(String),
    /// The sink no longer accepts readings.
    Closed,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "sink I/O error: {}", e),
            SinkError::Encode(msg) => write!(f, "cannot encode reading: {}", msg),
            SinkError::Closed => write!(f, "sink is closed"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// Destination for validated readings. Implementations must tolerate
/// concurrent callers.
pub trait Sink: Send + Sync {
    fn accept(&self, reading: Reading) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn accept(&self, reading: Reading) -> Result<(), SinkError> {
        (**self).accept(reading)
    }
}

/// Keeps readings in memory. Handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    readings: Mutex<Vec<Reading>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for MemorySink {
    fn accept(&self, reading: Reading) -> Result<(), SinkError> {
        self.readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reading);
        Ok(())
    }
}

/// Why a delivery did not complete.
#[derive(Debug)]
pub enum DeliveryError {
    /// The sink did not accept within the deadline.
    Stalled { waited: Duration },
    /// The sink refused the reading.
    Rejected(SinkError),
    /// The worker thread exited (the sink panicked).
    WorkerGone,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Stalled { waited } => {
                write!(f, "sink did not accept within {} ms", waited.as_millis())
            }
            DeliveryError::Rejected(e) => write!(f, "sink rejected reading: {}", e),
            DeliveryError::WorkerGone => write!(f, "sink worker exited"),
        }
    }
}

impl std::error::Error for DeliveryError {}

type Ack = Sender<Result<(), SinkError>>;
type Job = (Reading, Ack);

/// Owns the sink worker thread and enforces the delivery deadline.
pub struct SinkHandoff {
    sink: Arc<dyn Sink>,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl SinkHandoff {
    pub fn spawn(sink: Arc<dyn Sink>, timeout: Duration) -> io::Result<Self> {
        let (tx, worker) = start_worker(Arc::clone(&sink))?;
        Ok(Self {
            sink,
            tx: Some(tx),
            worker: Some(worker),
            timeout,
        })
    }

    /// Hands `reading` to the worker and waits for its acknowledgement, all
    /// within the configured timeout.
    pub fn deliver(&self, reading: Reading) -> Result<(), DeliveryError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(DeliveryError::WorkerGone);
        };
        let start = Instant::now();
        let (ack_tx, ack_rx) = bounded(1);

        match tx.send_timeout((reading, ack_tx), self.timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                return Err(DeliveryError::Stalled {
                    waited: start.elapsed(),
                });
            }
            Err(SendTimeoutError::Disconnected(_)) => return Err(DeliveryError::WorkerGone),
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        match ack_rx.recv_timeout(remaining) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeliveryError::Rejected(e)),
            Err(RecvTimeoutError::Timeout) => Err(DeliveryError::Stalled {
                waited: start.elapsed(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DeliveryError::WorkerGone),
        }
    }

    /// Replaces a dead worker with a fresh one.
    pub fn respawn(&mut self) -> io::Result<()> {
        self.stop();
        let (tx, worker) = start_worker(Arc::clone(&self.sink))?;
        self.tx = Some(tx);
        self.worker = Some(worker);
        Ok(())
    }

    /// Closes the channel and waits up to the timeout for the worker to
    /// finish. A worker stuck inside the sink is detached.
    pub fn stop(&mut self) {
        self.tx = None;
        let Some(worker) = self.worker.take() else {
            return;
        };

        let deadline = Instant::now() + self.timeout;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                warn!("sink worker panicked");
            }
        } else {
            warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "sink worker still busy at shutdown, detaching"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for SinkHandoff {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_worker(sink: Arc<dyn Sink>) -> io::Result<(Sender<Job>, JoinHandle<()>)> {
    let (tx, rx) = bounded::<Job>(0);
    let handle = thread::Builder::new()
        .name("tempmeter-sink".into())
        .spawn(move || worker_loop(sink, rx))?;
    Ok((tx, handle))
}

fn worker_loop(sink: Arc<dyn Sink>, rx: Receiver<Job>) {
    debug!("sink worker started");
    for (reading, ack) in rx.iter() {
        let result = sink.accept(reading);
        // The deliverer may have given up already.
        let _ = ack.send(result);
    }
    debug!("sink worker stopped");
}
