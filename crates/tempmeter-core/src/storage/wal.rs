//! Write-ahead log framing.
//!
//! Each entry is `[len: u32 LE][crc32: u32 LE][bincode(Reading)]`. Decoding
//! stops at the first short, oversized or corrupt frame; everything before it
//! is trusted.

use std::fs;
use std::io;
use std::path::Path;

use crate::reading::Reading;

pub(crate) const WAL_FILE: &str = "wal.log";

const FRAME_HEADER_SIZE: usize = 8;
/// A bincode `Reading` is 25 bytes; anything far larger is garbage.
const MAX_ENTRY_SIZE: usize = 1024;

pub(crate) fn encode_entry(reading: &Reading) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(reading).map_err(io::Error::other)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Valid prefix of a WAL file.
#[derive(Debug, Default)]
pub(crate) struct WalScan {
    pub(crate) readings: Vec<Reading>,
    /// Byte length of the valid prefix.
    pub(crate) valid_len: u64,
    pub(crate) total_len: u64,
}

impl WalScan {
    pub(crate) fn garbage_len(&self) -> u64 {
        self.total_len - self.valid_len
    }
}

pub(crate) fn decode_entries(data: &[u8]) -> WalScan {
    let mut readings = Vec::new();
    let mut pos = 0usize;

    while pos + FRAME_HEADER_SIZE <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + FRAME_HEADER_SIZE;
        if len > MAX_ENTRY_SIZE || start + len > data.len() {
            break;
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match bincode::deserialize::<Reading>(payload) {
            Ok(reading) => readings.push(reading),
            Err(_) => break,
        }
        pos = start + len;
    }

    WalScan {
        readings,
        valid_len: pos as u64,
        total_len: data.len() as u64,
    }
}

/// Raw WAL contents. A missing file is an empty log.
pub(crate) fn read_wal_bytes(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Scans the WAL at `path`.
pub(crate) fn read_wal(path: &Path) -> io::Result<WalScan> {
    Ok(decode_entries(&read_wal_bytes(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_decode_in_order() {
        let a = Reading::new(1, 20.0, Some(30.0));
        let b = Reading::new(2, 21.0, None);
        let mut data = encode_entry(&a).unwrap();
        data.extend(encode_entry(&b).unwrap());

        let scan = decode_entries(&data);
        assert_eq!(scan.readings, vec![a, b]);
        assert_eq!(scan.valid_len, data.len() as u64);
        assert_eq!(scan.garbage_len(), 0);
    }

    #[test]
    fn test_torn_tail_is_excluded() {
        let a = Reading::new(1, 20.0, None);
        let mut data = encode_entry(&a).unwrap();
        let valid = data.len();
        let torn = encode_entry(&Reading::new(2, 22.0, None)).unwrap();
        data.extend_from_slice(&torn[..torn.len() - 3]);

        let scan = decode_entries(&data);
        assert_eq!(scan.readings, vec![a]);
        assert_eq!(scan.valid_len, valid as u64);
        assert_eq!(scan.garbage_len(), (torn.len() - 3) as u64);
    }

    #[test]
    fn test_bad_checksum_stops_decoding() {
        let mut data = encode_entry(&Reading::new(1, 20.0, None)).unwrap();
        let second = data.len();
        data.extend(encode_entry(&Reading::new(2, 20.0, None)).unwrap());
        data[second + FRAME_HEADER_SIZE] ^= 0x01;

        let scan = decode_entries(&data);
        assert_eq!(scan.readings.len(), 1);
        assert_eq!(scan.valid_len, second as u64);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scan = read_wal(&dir.path().join(WAL_FILE)).unwrap();
        assert!(scan.readings.is_empty());
        assert_eq!(scan.total_len, 0);
    }
}
