use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::Receiver;
use tracing::{debug, error, info};

use super::faults::{FaultEvent, FaultKind, FaultReporter};
use super::retry::RetryBudget;
use super::sink::{DeliveryError, Sink, SinkHandoff};
use crate::config::{ConfigError, IngestConfig};
use crate::framing::{Frame, FrameReader};
use crate::parser::ReadingParser;
use crate::reading::Reading;
use crate::serial::{PortConnection, SerialBackend};

/// Backoff sleeps are cut into slices so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Stopped,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Idle => "idle",
            IngestState::Connecting => "connecting",
            IngestState::Streaming => "streaming",
            IngestState::Backoff => "backoff",
            IngestState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running counters, never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub frames: u64,
    /// Frames holding only whitespace; skipped, not parse errors.
    pub blank_frames: u64,
    /// Readings acknowledged by the sink.
    pub readings: u64,
    pub parse_errors: u64,
    pub sink_stalls: u64,
    pub sink_rejections: u64,
    pub overflows: u64,
    pub connect_failures: u64,
    pub io_failures: u64,
    /// Successful opens, the first one included.
    pub connects: u64,
}

impl IngestStats {
    /// Successful opens after the first.
    pub fn reconnects(&self) -> u64 {
        self.connects.saturating_sub(1)
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} readings={} parse_errors={} blank={} stalls={} rejected={} \
             overflows={} connect_failures={} io_failures={} reconnects={}",
            self.frames,
            self.readings,
            self.parse_errors,
            self.blank_frames,
            self.sink_stalls,
            self.sink_rejections,
            self.overflows,
            self.connect_failures,
            self.io_failures,
            self.reconnects()
        )
    }
}

/// Cooperative stop request shared between the loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum IngestError {
    Config(ConfigError),
    /// The sink worker thread could not be started.
    Spawn(io::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Config(e) => write!(f, "invalid configuration: {}", e),
            IngestError::Spawn(e) => write!(f, "cannot start sink worker: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ConfigError> for IngestError {
    fn from(e: ConfigError) -> Self {
        IngestError::Config(e)
    }
}

/// Drives one serial device from connect to shutdown.
///
/// Each `step` performs exactly one state transition; `run` steps until a
/// shutdown has been requested.
pub struct IngestionLoop<B: SerialBackend> {
    config: IngestConfig,
    connection: PortConnection<B>,
    frames: FrameReader,
    parser: ReadingParser,
    retry: RetryBudget,
    state: IngestState,
    stats: IngestStats,
    faults: FaultReporter,
    sink: SinkHandoff,
    shutdown: ShutdownSignal,
    pending_backoff: Option<Duration>,
}

impl<B: SerialBackend> IngestionLoop<B> {
    /// Validates `config`, starts the sink worker and returns the loop with
    /// the receiving end of its fault channel.
    pub fn new(
        config: IngestConfig,
        backend: B,
        sink: Arc<dyn Sink>,
    ) -> Result<(Self, Receiver<FaultEvent>), IngestError> {
        config.validate()?;

        let (faults, fault_rx) = FaultReporter::new(config.fault_queue_capacity);
        let sink = SinkHandoff::spawn(sink, config.sink_timeout).map_err(IngestError::Spawn)?;

        let ingest = Self {
            connection: PortConnection::new(backend, config.port.clone()),
            frames: FrameReader::new(&config.framing),
            parser: ReadingParser::new(&config.format),
            retry: RetryBudget::new(),
            state: IngestState::Idle,
            stats: IngestStats::default(),
            faults,
            sink,
            shutdown: ShutdownSignal::new(),
            pending_backoff: None,
            config,
        };
        Ok((ingest, fault_rx))
    }

    /// Performs one transition and returns the resulting state.
    pub fn step(&mut self) -> IngestState {
        if self.shutdown.is_requested() {
            return self.stop();
        }

        self.state = match self.state {
            IngestState::Idle => {
                info!(port = %self.config.port.port, "ingestion starting");
                IngestState::Connecting
            }
            IngestState::Connecting => self.connect(),
            IngestState::Streaming => self.stream_once(),
            IngestState::Backoff => self.wait_backoff(),
            IngestState::Stopped => IngestState::Stopped,
        };
        self.state
    }

    /// Steps until stopped and returns the final counters.
    pub fn run(&mut self) -> IngestStats {
        while self.step() != IngestState::Stopped {}
        self.stats.clone()
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn connection(&self) -> &PortConnection<B> {
        &self.connection
    }

    pub fn retry_budget(&self) -> &RetryBudget {
        &self.retry
    }

    /// Delay the loop will sleep on its next step, while in `Backoff`.
    pub fn pending_backoff(&self) -> Option<Duration> {
        self.pending_backoff
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Fault events dropped because the channel was full.
    pub fn dropped_faults(&self) -> u64 {
        self.faults.dropped()
    }

    fn connect(&mut self) -> IngestState {
        match self.connection.open() {
            Ok(()) => {
                self.retry.reset();
                self.frames.reset();
                self.stats.connects += 1;
                if self.stats.connects > 1 {
                    info!(port = %self.config.port.port, "reconnected");
                }
                IngestState::Streaming
            }
            Err(e) => {
                self.stats.connect_failures += 1;
                self.faults.report(FaultKind::ConnectError, e.to_string());
                self.enter_backoff()
            }
        }
    }

    fn stream_once(&mut self) -> IngestState {
        match self.connection.read_chunk(self.config.port.read_timeout) {
            Ok(chunk) => self.frames.feed(chunk),
            Err(e) => {
                self.stats.io_failures += 1;
                self.faults.report(FaultKind::IoError, e.to_string());
                return self.enter_backoff();
            }
        }

        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => return IngestState::Streaming,
                Err(overflow) => {
                    self.stats.overflows += 1;
                    self.faults
                        .report(FaultKind::FrameOverflow, overflow.to_string());
                    return self.enter_backoff();
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.stats.frames += 1;
        if frame.is_blank() {
            self.stats.blank_frames += 1;
            return;
        }

        let captured_at = chrono::Utc::now().timestamp();
        match self.parser.parse(&frame, captured_at) {
            Ok(reading) => {
                self.retry.reset();
                self.deliver(reading);
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                self.faults
                    .report(FaultKind::ParseError, format!("{} (frame: {})", e, frame));
            }
        }
    }

    fn deliver(&mut self, reading: Reading) {
        match self.sink.deliver(reading) {
            Ok(()) => {
                self.stats.readings += 1;
                debug!(
                    timestamp = reading.timestamp(),
                    temperature = reading.temperature(),
                    humidity = ?reading.humidity(),
                    "reading stored"
                );
            }
            Err(DeliveryError::Stalled { waited }) => {
                self.stats.sink_stalls += 1;
                self.faults.report(
                    FaultKind::SinkStall,
                    format!(
                        "reading at {} dropped after waiting {} ms",
                        reading.timestamp(),
                        waited.as_millis()
                    ),
                );
            }
            Err(DeliveryError::Rejected(e)) => {
                self.stats.sink_rejections += 1;
                self.faults.report(FaultKind::SinkRejected, e.to_string());
            }
            Err(DeliveryError::WorkerGone) => {
                self.stats.sink_rejections += 1;
                self.faults.report(
                    FaultKind::SinkRejected,
                    "sink worker exited, restarting it".to_string(),
                );
                if let Err(e) = self.sink.respawn() {
                    error!(error = %e, "cannot restart sink worker");
                }
            }
        }
    }

    /// Closes the port and schedules the next open attempt.
    fn enter_backoff(&mut self) -> IngestState {
        self.connection.close();
        let delay = self.retry.record_failure(&self.config.backoff);
        self.pending_backoff = Some(delay);
        info!(
            delay_ms = delay.as_millis() as u64,
            failures = self.retry.failures(),
            "backing off before reconnect"
        );
        IngestState::Backoff
    }

    fn wait_backoff(&mut self) -> IngestState {
        let mut remaining = self.pending_backoff.take().unwrap_or(Duration::ZERO);
        while remaining > Duration::ZERO {
            if self.shutdown.is_requested() {
                return self.stop();
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        IngestState::Connecting
    }

    fn stop(&mut self) -> IngestState {
        if self.state != IngestState::Stopped {
            self.connection.close();
            self.sink.stop();
            self.pending_backoff = None;
            self.state = IngestState::Stopped;
            info!(stats = %self.stats, "ingestion stopped");
        }
        IngestState::Stopped
    }
}
