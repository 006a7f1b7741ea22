//! The ingestion pipeline driver.
//!
//! ```text
//! PortConnection ──bytes──▶ FrameReader ──Frame──▶ ReadingParser ──Reading──▶ SinkHandoff ──▶ Sink
//!        ▲                                                                          (worker thread)
//!        └──────────── IngestionLoop: Idle → Connecting → Streaming ⇄ Backoff → Stopped
//! ```
//!
//! Everything on the left is owned by one `IngestionLoop` on one thread. The
//! only shared pieces are the sink (behind a rendezvous channel), the fault
//! event channel and the shutdown flag.

pub mod faults;
mod ingestor;
pub mod retry;
pub mod sink;

pub use faults::{FaultEvent, FaultKind, FaultReporter};
pub use ingestor::{IngestError, IngestState, IngestStats, IngestionLoop, ShutdownSignal};
pub use retry::RetryBudget;
pub use sink::{DeliveryError, MemorySink, Sink, SinkError, SinkHandoff};
