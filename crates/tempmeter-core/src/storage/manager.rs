use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tracing::{debug, error, info, warn};

use super::chunk;
use super::wal::{self, WAL_FILE};
use crate::ingest::{Sink, SinkError};
use crate::reading::Reading;

const CHUNK_PREFIX: &str = "readings_";
const CHUNK_EXT: &str = "zst";
/// One hour of readings at one per second.
const DEFAULT_CHUNK_SIZE_LIMIT: usize = 3600;

/// Configuration for automatic data rotation.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Maximum total size of all chunk files in bytes. Default: 256MB.
    pub max_total_size: u64,
    /// Maximum retention period in days. Default: 30 days.
    pub max_retention_days: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_total_size: 256 * 1024 * 1024,
            max_retention_days: 30,
        }
    }
}

impl RotationConfig {
    pub fn new(max_total_size: u64, max_retention_days: u32) -> Self {
        Self {
            max_total_size,
            max_retention_days,
        }
    }
}

/// Result of a rotation operation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RotationResult {
    pub files_removed_by_age: usize,
    pub files_removed_by_size: usize,
    pub bytes_freed: u64,
    /// Total size of remaining chunk files after rotation.
    pub total_size_after: u64,
    pub files_remaining: usize,
}

/// Summary of what a data directory holds.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub chunk_files: usize,
    pub chunk_bytes: u64,
    pub chunk_readings: usize,
    pub wal_readings: usize,
    pub wal_bytes: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

struct StoreInner {
    wal_file: File,
    /// Entries currently in the WAL.
    wal_entries: usize,
    /// UTC hour of the readings currently in the WAL.
    current_hour: Option<(NaiveDate, u32)>,
}

/// Append-only reading store: a WAL for durability plus hourly chunk files.
///
/// All methods take `&self`; a mutex serializes writers, flushes and
/// queries so the store can be shared between the sink worker and readers.
pub struct ReadingStore {
    base_path: PathBuf,
    chunk_size_limit: usize,
    inner: Mutex<StoreInner>,
}

impl ReadingStore {
    /// Opens (or creates) the store in `base_path`, recovering the WAL.
    pub fn open(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        // Leftovers of an interrupted chunk write.
        for entry in fs::read_dir(&base_path)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "removing stale temporary file");
                let _ = fs::remove_file(path);
            }
        }

        let wal_path = base_path.join(WAL_FILE);
        let scan = wal::read_wal(&wal_path)?;
        if scan.garbage_len() > 0 {
            warn!(
                "WAL corruption detected: {} garbage bytes after {} valid records. Truncating WAL.",
                scan.garbage_len(),
                scan.readings.len()
            );
            OpenOptions::new()
                .write(true)
                .open(&wal_path)?
                .set_len(scan.valid_len)?;
        }

        let wal_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)?;

        if !scan.readings.is_empty() {
            info!(entries = scan.readings.len(), "recovered readings from WAL");
        }

        Ok(Self {
            base_path,
            chunk_size_limit: DEFAULT_CHUNK_SIZE_LIMIT,
            inner: Mutex::new(StoreInner {
                wal_file,
                wal_entries: scan.readings.len(),
                current_hour: scan.readings.last().map(|r| hour_of(r.timestamp())),
            }),
        })
    }

    /// Flushes to a chunk once the WAL holds `limit` entries.
    pub fn with_chunk_size_limit(mut self, limit: usize) -> Self {
        self.chunk_size_limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends one reading with hourly segmentation.
    /// Returns true if a chunk was flushed (hour boundary crossed or size limit reached).
    pub fn append(&self, reading: Reading) -> io::Result<bool> {
        let mut inner = self.lock();
        let hour = hour_of(reading.timestamp());
        let mut flushed = false;

        let advance = match inner.current_hour {
            Some(prev) if prev != hour && inner.wal_entries > 0 => {
                // Readings stay in the WAL, still dated `prev`, until a
                // later flush succeeds.
                match self.flush_locked(&mut inner, prev) {
                    Ok(wrote) => {
                        flushed = wrote;
                        true
                    }
                    Err(e) => {
                        error!(error = %e, "failed to flush hourly chunk");
                        false
                    }
                }
            }
            _ => true,
        };
        if advance {
            inner.current_hour = Some(hour);
        }

        let frame = wal::encode_entry(&reading)?;
        inner.wal_file.write_all(&frame)?;
        inner.wal_file.sync_all()?;
        inner.wal_entries += 1;

        if inner.wal_entries >= self.chunk_size_limit {
            let segment = inner.current_hour.unwrap_or(hour);
            flushed |= self.flush_locked(&mut inner, segment)?;
        }

        Ok(flushed)
    }

    /// Moves everything in the WAL into a chunk. Returns false if the WAL was empty.
    pub fn flush(&self) -> io::Result<bool> {
        let mut inner = self.lock();
        let hour = inner
            .current_hour
            .unwrap_or_else(|| hour_of(Utc::now().timestamp()));
        self.flush_locked(&mut inner, hour)
    }

    /// File naming format: readings_YYYY-MM-DD_HH.zst
    fn flush_locked(
        &self,
        inner: &mut StoreInner,
        (date, hour): (NaiveDate, u32),
    ) -> io::Result<bool> {
        let scan = wal::read_wal(&self.wal_path())?;
        if scan.readings.is_empty() {
            inner.wal_entries = 0;
            return Ok(false);
        }

        let stem = format!("{}{}_{:02}", CHUNK_PREFIX, date.format("%Y-%m-%d"), hour);
        let mut path = self.base_path.join(format!("{}.{}", stem, CHUNK_EXT));
        // Same hour flushed twice (size limit, restart): keep both.
        if path.exists() {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
            path = self.base_path.join(format!("{}_{}.{}", stem, nanos, CHUNK_EXT));
        }

        chunk::write_chunk(&path, &scan.readings)?;

        inner.wal_file.set_len(0)?;
        inner.wal_file.sync_all()?;
        inner.wal_entries = 0;

        info!(
            path = %path.display(),
            readings = scan.readings.len(),
            "flushed chunk"
        );
        Ok(true)
    }

    /// Number of readings in the WAL (unflushed).
    pub fn pending_len(&self) -> usize {
        self.lock().wal_entries
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn wal_path(&self) -> PathBuf {
        self.base_path.join(WAL_FILE)
    }

    /// Chunk files in the store, oldest first.
    pub fn chunk_files(&self) -> io::Result<Vec<PathBuf>> {
        list_chunks(&self.base_path)
    }

    /// Runs `f` on the data directory with writers excluded, so a
    /// concurrent flush is never seen half done.
    pub(crate) fn with_lock<T>(&self, f: impl FnOnce(&Path) -> io::Result<T>) -> io::Result<T> {
        let _guard = self.lock();
        f(&self.base_path)
    }

    pub fn stats(&self) -> io::Result<StoreStats> {
        self.with_lock(directory_stats)
    }

    /// Rotates chunk files according to the given configuration.
    pub fn rotate(&self, config: &RotationConfig) -> io::Result<RotationResult> {
        self.rotate_at(config, Utc::now().date_naive())
    }

    /// Removes files based on two criteria:
    /// 1. Files dated before `today - max_retention_days`
    /// 2. Oldest files while total size exceeds `max_total_size`
    pub fn rotate_at(
        &self,
        config: &RotationConfig,
        today: NaiveDate,
    ) -> io::Result<RotationResult> {
        let _guard = self.lock();
        let mut result = RotationResult::default();

        let mut files: Vec<FileInfo> = Vec::new();
        for path in list_chunks(&self.base_path)? {
            let size = fs::metadata(&path)?.len();
            let date = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_chunk_name)
                .map(|(date, _)| date);
            files.push(FileInfo { path, size, date });
        }

        let retention_limit = today - chrono::Duration::days(config.max_retention_days as i64);

        let mut remaining: Vec<FileInfo> = Vec::new();
        for file in files {
            if let Some(date) = file.date
                && date < retention_limit
            {
                fs::remove_file(&file.path)?;
                result.files_removed_by_age += 1;
                result.bytes_freed += file.size;
                continue;
            }
            remaining.push(file);
        }

        let mut total_size: u64 = remaining.iter().map(|f| f.size).sum();

        // Oldest first, since chunk names sort by hour.
        while total_size > config.max_total_size && !remaining.is_empty() {
            let file = remaining.remove(0);
            fs::remove_file(&file.path)?;
            result.files_removed_by_size += 1;
            result.bytes_freed += file.size;
            total_size -= file.size;
        }

        result.total_size_after = total_size;
        result.files_remaining = remaining.len();

        if result.files_removed_by_age + result.files_removed_by_size > 0 {
            info!(
                by_age = result.files_removed_by_age,
                by_size = result.files_removed_by_size,
                bytes_freed = result.bytes_freed,
                "rotated chunk files"
            );
        }
        Ok(result)
    }
}

impl Sink for ReadingStore {
    fn accept(&self, reading: Reading) -> Result<(), SinkError> {
        self.append(reading)?;
        Ok(())
    }
}

/// Information about a chunk file for rotation.
struct FileInfo {
    path: PathBuf,
    size: u64,
    date: Option<NaiveDate>,
}

fn hour_of(timestamp: i64) -> (NaiveDate, u32) {
    let time = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();
    (time.date_naive(), time.hour())
}

/// Parses `readings_YYYY-MM-DD_HH.zst`, with or without a collision suffix.
pub(crate) fn parse_chunk_name(filename: &str) -> Option<(NaiveDate, u32)> {
    let stem = filename.strip_prefix(CHUNK_PREFIX)?.strip_suffix(".zst")?;
    let mut parts = stem.split('_');
    let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let hour: u32 = parts.next()?.parse().ok()?;
    (hour < 24).then_some((date, hour))
}

/// Chunk files under `dir`, sorted by name (and therefore by hour).
pub(crate) fn list_chunks(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_chunk = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| parse_chunk_name(n).is_some());
        if is_chunk {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// The files a query reads, captured at one instant.
///
/// Capturing only lists chunk names and copies the WAL bytes, so it is cheap
/// enough to do under the store lock. Chunks are never rewritten once renamed
/// into place, so decoding them later sees the same data.
pub(crate) struct StoreView {
    pub(crate) chunks: Vec<PathBuf>,
    wal: Vec<u8>,
}

impl StoreView {
    pub(crate) fn capture(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            chunks: list_chunks(dir)?,
            wal: wal::read_wal_bytes(&dir.join(WAL_FILE))?,
        })
    }

    pub(crate) fn wal_readings(&self) -> Vec<Reading> {
        wal::decode_entries(&self.wal).readings
    }

    /// Readings from every chunk overlapping `[start, end]` plus the WAL.
    /// A chunk that vanished since the capture (rotation) is skipped.
    pub(crate) fn load(&self, start: i64, end: i64) -> Vec<Reading> {
        let mut readings = Vec::new();
        for path in &self.chunks {
            match chunk::read_chunk_metadata(path) {
                Ok(meta) if !meta.overlaps(start, end) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable chunk");
                    continue;
                }
            }
            match chunk::read_chunk(path) {
                Ok(chunk) => readings.extend(chunk),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt chunk"),
            }
        }
        readings.extend(self.wal_readings());
        readings
    }
}

pub(crate) fn directory_stats(dir: &Path) -> io::Result<StoreStats> {
    fn widen(stats: &mut StoreStats, first: i64, last: i64) {
        stats.first_timestamp = Some(stats.first_timestamp.map_or(first, |t| t.min(first)));
        stats.last_timestamp = Some(stats.last_timestamp.map_or(last, |t| t.max(last)));
    }

    let mut stats = StoreStats::default();
    for path in list_chunks(dir)? {
        stats.chunk_files += 1;
        stats.chunk_bytes += fs::metadata(&path)?.len();
        if let Ok(meta) = chunk::read_chunk_metadata(&path) {
            stats.chunk_readings += meta.count;
            widen(&mut stats, meta.first_timestamp, meta.last_timestamp);
        }
    }

    let scan = wal::read_wal(&dir.join(WAL_FILE))?;
    stats.wal_bytes = scan.total_len;
    stats.wal_readings = scan.readings.len();
    for reading in &scan.readings {
        widen(&mut stats, reading.timestamp(), reading.timestamp());
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// 2023-11-14 22:13:20 UTC
    const T0: i64 = 1_700_000_000;

    fn reading(ts: i64, temperature: f64) -> Reading {
        Reading::new(ts, temperature, None)
    }

    #[test]
    fn test_size_limit_flushes_chunk() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap().with_chunk_size_limit(2);

        assert!(!store.append(reading(T0, 20.0)).unwrap());
        assert!(store.append(reading(T0 + 1, 20.5)).unwrap());
        assert_eq!(store.pending_len(), 0);

        let chunks = store.chunk_files().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].file_name().unwrap().to_str().unwrap(),
            "readings_2023-11-14_22.zst"
        );
        assert_eq!(
            chunk::read_chunk(&chunks[0]).unwrap(),
            vec![reading(T0, 20.0), reading(T0 + 1, 20.5)]
        );
    }

    #[test]
    fn test_hour_boundary_flushes_previous_hour() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();

        // 22:13:20 and 22:59:59, then 23:00:00
        store.append(reading(T0, 20.0)).unwrap();
        store.append(reading(T0 + 2799, 20.1)).unwrap();
        assert!(store.append(reading(T0 + 2800, 20.2)).unwrap());

        let names: Vec<String> = store
            .chunk_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["readings_2023-11-14_22.zst"]);
        assert_eq!(store.pending_len(), 1);

        store.flush().unwrap();
        assert_eq!(store.chunk_files().unwrap().len(), 2);
        assert!(dir.path().join("readings_2023-11-14_23.zst").exists());
    }

    #[test]
    fn test_failed_hour_flush_keeps_previous_hour_name() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        store.append(reading(T0, 20.0)).unwrap();

        // A directory in place of the temporary file makes the chunk write fail.
        let blocker = dir.path().join("readings_2023-11-14_22.tmp");
        fs::create_dir(&blocker).unwrap();
        assert!(!store.append(reading(T0 + 3600, 21.0)).unwrap());
        assert_eq!(store.pending_len(), 2);
        assert!(store.chunk_files().unwrap().is_empty());

        fs::remove_dir(&blocker).unwrap();
        assert!(store.append(reading(T0 + 3601, 21.5)).unwrap());

        let names: Vec<String> = store
            .chunk_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["readings_2023-11-14_22.zst"]);
        let flushed = chunk::read_chunk(&dir.path().join(&names[0])).unwrap();
        assert_eq!(flushed[0], reading(T0, 20.0));
        assert_eq!(store.pending_len(), 1);
    }

    #[test]
    fn test_same_hour_flushed_twice_keeps_both() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        store.append(reading(T0, 20.0)).unwrap();
        store.flush().unwrap();
        store.append(reading(T0 + 1, 21.0)).unwrap();
        store.flush().unwrap();

        assert_eq!(store.chunk_files().unwrap().len(), 2);
        assert!(!store.flush().unwrap());
    }

    #[test]
    fn test_wal_recovery_after_crash() {
        let dir = tempdir().unwrap();
        {
            let store = ReadingStore::open(dir.path()).unwrap();
            store.append(reading(T0, 19.0)).unwrap();
            store.append(reading(T0 + 5, 19.5)).unwrap();
            // Dropped without flushing (simulated crash).
        }

        let store = ReadingStore::open(dir.path()).unwrap();
        assert_eq!(store.pending_len(), 2);
        assert!(store.flush().unwrap());
        assert!(dir.path().join("readings_2023-11-14_22.zst").exists());
    }

    #[test]
    fn test_wal_garbage_is_truncated() {
        let dir = tempdir().unwrap();
        {
            let store = ReadingStore::open(dir.path()).unwrap();
            store.append(reading(T0, 19.0)).unwrap();
        }
        let wal_path = dir.path().join(WAL_FILE);
        let valid_len = fs::metadata(&wal_path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[0x19, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let store = ReadingStore::open(dir.path()).unwrap();
        assert_eq!(store.pending_len(), 1);
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), valid_len);

        store.append(reading(T0 + 1, 19.1)).unwrap();
        let scan = wal::read_wal(&wal_path).unwrap();
        assert_eq!(scan.readings.len(), 2);
        assert_eq!(scan.garbage_len(), 0);
    }

    #[test]
    fn test_stale_tmp_files_are_removed() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("readings_2023-11-14_22.tmp");
        fs::write(&tmp, b"half written").unwrap();

        ReadingStore::open(dir.path()).unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn test_sink_appends() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        store.accept(reading(T0, 22.0)).unwrap();
        assert_eq!(store.pending_len(), 1);
    }

    #[test]
    fn test_rotation_by_days() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let old_file = dir.path().join("readings_2026-10-01_12.zst");
        let recent_file = dir.path().join("readings_2026-10-16_12.zst");
        fs::write(&old_file, b"old data").unwrap();
        fs::write(&recent_file, b"recent data").unwrap();

        let result = store
            .rotate_at(&RotationConfig::new(1_000_000_000, 7), today)
            .unwrap();

        assert_eq!(result.files_removed_by_age, 1);
        assert_eq!(result.files_remaining, 1);
        assert!(!old_file.exists());
        assert!(recent_file.exists());
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let file1 = dir.path().join("readings_2026-10-16_10.zst");
        let file2 = dir.path().join("readings_2026-10-17_10.zst");
        let file3 = dir.path().join("readings_2026-10-18_10.zst");
        for file in [&file1, &file2, &file3] {
            fs::write(file, vec![0u8; 500]).unwrap();
        }

        let result = store.rotate_at(&RotationConfig::new(1000, 365), today).unwrap();

        assert_eq!(result.files_removed_by_size, 1);
        assert_eq!(result.files_remaining, 2);
        assert_eq!(result.total_size_after, 1000);
        assert!(!file1.exists());
        assert!(file2.exists());
        assert!(file3.exists());
    }

    #[test]
    fn test_parse_chunk_name() {
        assert_eq!(
            parse_chunk_name("readings_2026-02-07_17.zst"),
            Some((NaiveDate::from_ymd_opt(2026, 2, 7).unwrap(), 17))
        );
        assert!(parse_chunk_name("readings_2026-02-07_17_123456789.zst").is_some());
        assert_eq!(parse_chunk_name("readings_2026-02-07_24.zst"), None);
        assert_eq!(parse_chunk_name("snapshots_2026-02-07_17.zst"), None);
        assert_eq!(parse_chunk_name("wal.log"), None);
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let store = ReadingStore::open(dir.path()).unwrap();
        store.append(reading(T0, 20.0)).unwrap();
        store.flush().unwrap();
        store.append(reading(T0 + 10, 20.0)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunk_files, 1);
        assert_eq!(stats.chunk_readings, 1);
        assert_eq!(stats.wal_readings, 1);
        assert_eq!(stats.first_timestamp, Some(T0));
        assert_eq!(stats.last_timestamp, Some(T0 + 10));
    }
}
