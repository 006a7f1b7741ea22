//! Operator-facing fault events.
//!
//! Every recoverable failure in the pipeline is logged through `tracing` and
//! also offered to a bounded channel so a supervisor can tally or forward it.
//! The channel never blocks the ingestion thread: when it is full the event
//! is dropped and counted.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ConnectError,
    IoError,
    FrameOverflow,
    ParseError,
    SinkStall,
    SinkRejected,
}

impl FaultKind {
    pub const ALL: [FaultKind; 6] = [
        FaultKind::ConnectError,
        FaultKind::IoError,
        FaultKind::FrameOverflow,
        FaultKind::ParseError,
        FaultKind::SinkStall,
        FaultKind::SinkRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::ConnectError => "connect_error",
            FaultKind::IoError => "io_error",
            FaultKind::FrameOverflow => "frame_overflow",
            FaultKind::ParseError => "parse_error",
            FaultKind::SinkStall => "sink_stall",
            FaultKind::SinkRejected => "sink_rejected",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultEvent {
    pub kind: FaultKind,
    /// Unix seconds (UTC) at which the fault was observed.
    pub timestamp: i64,
    pub detail: String,
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.timestamp, self.kind, self.detail)
    }
}

/// Sending half of the fault channel.
#[derive(Clone)]
pub struct FaultReporter {
    tx: Sender<FaultEvent>,
    dropped: Arc<AtomicU64>,
}

impl FaultReporter {
    /// Creates a reporter and the receiver the supervisor drains.
    pub fn new(capacity: usize) -> (Self, Receiver<FaultEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn report(&self, kind: FaultKind, detail: impl Into<String>) {
        self.report_at(kind, chrono::Utc::now().timestamp(), detail);
    }

    pub fn report_at(&self, kind: FaultKind, timestamp: i64, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(kind = kind.as_str(), "{}", detail);

        let event = FaultEvent {
            kind,
            timestamp,
            detail,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            // Nobody listening is the same as a full queue for accounting.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events that could not be queued.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_delivered_in_order() {
        let (reporter, rx) = FaultReporter::new(8);
        reporter.report_at(FaultKind::ConnectError, 10, "port not found");
        reporter.report_at(FaultKind::ParseError, 11, "bad frame");

        let events: Vec<FaultEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, FaultKind::ConnectError);
        assert_eq!(events[1].timestamp, 11);
        assert_eq!(events[1].detail, "bad frame");
        assert_eq!(reporter.dropped(), 0);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (reporter, rx) = FaultReporter::new(2);
        for i in 0..5 {
            reporter.report_at(FaultKind::IoError, i, "broken pipe");
        }
        assert_eq!(rx.len(), 2);
        assert_eq!(reporter.dropped(), 3);
        // The oldest events are the ones kept.
        assert_eq!(rx.recv().unwrap().timestamp, 0);
    }

    #[test]
    fn test_disconnected_receiver_counts_drops() {
        let (reporter, rx) = FaultReporter::new(4);
        drop(rx);
        reporter.report(FaultKind::SinkStall, "timeout");
        assert_eq!(reporter.dropped(), 1);
    }

    #[test]
    fn test_kind_names() {
        let names: Vec<&str> = FaultKind::ALL.iter().map(FaultKind::as_str).collect();
        assert_eq!(
            names,
            [
                "connect_error",
                "io_error",
                "frame_overflow",
                "parse_error",
                "sink_stall",
                "sink_rejected"
            ]
        );
        let event = FaultEvent {
            kind: FaultKind::FrameOverflow,
            timestamp: 3,
            detail: "too long".into(),
        };
        assert_eq!(event.to_string(), "[3] frame_overflow: too long");
    }
}
