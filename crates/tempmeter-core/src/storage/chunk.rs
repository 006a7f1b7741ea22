//! Hourly chunk file format.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (40 bytes, uncompressed)              │
//! │   magic: [u8; 4]       = b"TMC1"             │
//! │   version: u16         = 1                   │
//! │   _reserved: u16       = 0                   │
//! │   count: u32                                 │
//! │   crc32: u32           (of the payload)      │
//! │   first_ts: i64                              │
//! │   last_ts: i64                               │
//! │   payload_len: u64                           │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD                                      │
//! │   zstd(postcard(Vec<Reading>))               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! `first_ts`/`last_ts` are the minimum and maximum reading timestamps, so a
//! range query can skip a chunk after reading 40 bytes.

use std::fs;
use std::io::{self, Read as _, Write};
use std::path::Path;

use tracing::warn;

use crate::reading::Reading;

const MAGIC: [u8; 4] = *b"TMC1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 40;
const ZSTD_LEVEL: i32 = 3;

/// Header fields of a chunk, readable without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub count: usize,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub payload_len: u64,
    crc: u32,
}

impl ChunkMetadata {
    /// True when the chunk may hold readings in `[start, end]`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.first_timestamp <= end && self.last_timestamp >= start
    }
}

fn field<const N: usize>(header: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&header[at..at + N]);
    out
}

fn parse_header(header: &[u8; HEADER_SIZE]) -> io::Result<ChunkMetadata> {
    if header[0..4] != MAGIC {
        return Err(io::Error::other(format!(
            "invalid magic: expected TMC1, got {:?}",
            &header[0..4]
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(io::Error::other(format!(
            "unsupported chunk version: {}",
            version
        )));
    }

    Ok(ChunkMetadata {
        count: u32::from_le_bytes(field(header, 8)) as usize,
        crc: u32::from_le_bytes(field(header, 12)),
        first_timestamp: i64::from_le_bytes(field(header, 16)),
        last_timestamp: i64::from_le_bytes(field(header, 24)),
        payload_len: u64::from_le_bytes(field(header, 32)),
    })
}

/// Reads only the 40-byte header.
pub fn read_chunk_metadata(path: &Path) -> io::Result<ChunkMetadata> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    parse_header(&header)
}

/// Reads and verifies a whole chunk.
pub fn read_chunk(path: &Path) -> io::Result<Vec<Reading>> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(io::Error::other("file too small for header"));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&data[..HEADER_SIZE]);
    let meta = parse_header(&header)?;

    let payload = &data[HEADER_SIZE..];
    if payload.len() as u64 != meta.payload_len {
        return Err(io::Error::other(format!(
            "payload length mismatch: header says {}, file has {}",
            meta.payload_len,
            payload.len()
        )));
    }
    let crc = crc32fast::hash(payload);
    if crc != meta.crc {
        return Err(io::Error::other(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            meta.crc, crc
        )));
    }

    let decompressed = zstd::decode_all(payload)?;
    let readings: Vec<Reading> = postcard::from_bytes(&decompressed).map_err(|e| {
        warn!(
            path = %path.display(),
            decompressed_len = decompressed.len(),
            error = %e,
            "chunk: payload deserialization failed"
        );
        io::Error::other(e)
    })?;

    if readings.len() != meta.count {
        return Err(io::Error::other(format!(
            "reading count mismatch: header says {}, payload has {}",
            meta.count,
            readings.len()
        )));
    }
    Ok(readings)
}

/// Writes `readings` as a chunk, atomically via a `.tmp` sibling.
pub fn write_chunk(path: &Path, readings: &[Reading]) -> io::Result<()> {
    if readings.is_empty() {
        return Err(io::Error::other("cannot write empty chunk"));
    }
    let count = u32::try_from(readings.len())
        .map_err(|_| io::Error::other("too many readings for chunk format"))?;

    let first_ts = readings.iter().map(Reading::timestamp).min().unwrap_or(0);
    let last_ts = readings.iter().map(Reading::timestamp).max().unwrap_or(0);

    let raw = postcard::to_allocvec(readings).map_err(io::Error::other)?;
    let payload = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&count.to_le_bytes());
    header[12..16].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    header[16..24].copy_from_slice(&first_ts.to_le_bytes());
    header[24..32].copy_from_slice(&last_ts.to_le_bytes());
    header[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes());

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn readings() -> Vec<Reading> {
        vec![
            Reading::new(1_700_000_010, 21.5, Some(40.0)),
            Reading::new(1_700_000_000, 21.0, None),
            Reading::new(1_700_000_020, 22.0, Some(41.5)),
        ]
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readings_2023-11-14_22.zst");
        write_chunk(&path, &readings()).unwrap();

        assert_eq!(read_chunk(&path).unwrap(), readings());
        assert!(!path.with_extension("tmp").exists());

        let meta = read_chunk_metadata(&path).unwrap();
        assert_eq!(meta.count, 3);
        assert_eq!(meta.first_timestamp, 1_700_000_000);
        assert_eq!(meta.last_timestamp, 1_700_000_020);
        assert!(meta.overlaps(1_700_000_015, 1_800_000_000));
        assert!(meta.overlaps(0, 1_700_000_000));
        assert!(!meta.overlaps(1_700_000_021, i64::MAX));
    }

    #[test]
    fn test_empty_chunk_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.zst");
        assert!(write_chunk(&path, &[]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupted_payload_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.zst");
        write_chunk(&path, &readings()).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = read_chunk(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
        // The header alone is still readable.
        assert_eq!(read_chunk_metadata(&path).unwrap().count, 3);
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.zst");
        fs::write(&path, b"ABCD not a chunk at all, just some bytes padded out").unwrap();
        assert!(read_chunk_metadata(&path).is_err());

        fs::write(&path, b"TMC1").unwrap();
        assert!(read_chunk(&path).is_err());
        assert!(read_chunk_metadata(&path).is_err());
    }
}
