//! File-backed reading store.
//!
//! Layout of a data directory:
//!
//! ```text
//! <data-dir>/
//!   wal.log                          readings not yet in a chunk (CRC-framed)
//!   readings_2026-10-19_14.zst       one chunk per UTC hour of reading timestamps
//!   readings_2026-10-19_15.zst
//! ```

pub mod chunk;
mod manager;
pub mod query;
mod wal;

pub use chunk::{ChunkMetadata, read_chunk, read_chunk_metadata, write_chunk};
pub use manager::{ReadingStore, RotationConfig, RotationResult, StoreStats};
pub use query::{ArchiveReader, ReadingQuery};
