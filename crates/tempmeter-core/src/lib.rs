//! tempmeter-core — serial temperature ingestion library.
//!
//! Provides:
//! - `serial` — port backends (real `serialport`, scripted mock) and `PortConnection`
//! - `framing` — byte stream reassembly into delimited frames
//! - `parser` — frame to `Reading` conversion and validation
//! - `ingest` — the ingestion state machine, sink handoff, fault reporting, retry policy
//! - `storage` — file-backed reading store (WAL + hourly chunks) and the query interface
//! - `config` — explicit configuration for every stage

pub mod config;
pub mod framing;
pub mod ingest;
pub mod parser;
pub mod reading;
pub mod serial;
pub mod storage;

pub use reading::Reading;
