//! Read side of the store.
//!
//! `ReadingQuery` is the interface consumers see. `ReadingStore` implements
//! it by capturing its file set under the lock and decoding outside it;
//! `ArchiveReader` implements it for a directory owned by another process (a
//! running daemon) without touching the WAL.

use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use super::chunk;
use super::manager::{self, ReadingStore, StoreStats, StoreView};
use crate::reading::Reading;

const SECONDS_PER_DAY: i64 = 86_400;

/// Queries over stored readings. All results are oldest first and all
/// bounds are inclusive unix seconds.
pub trait ReadingQuery {
    fn range(&self, start: i64, end: i64) -> io::Result<Vec<Reading>>;

    fn all(&self) -> io::Result<Vec<Reading>> {
        self.range(i64::MIN, i64::MAX)
    }

    fn since(&self, start: i64) -> io::Result<Vec<Reading>> {
        self.range(start, i64::MAX)
    }

    /// Readings taken on `date` (UTC).
    fn on_date(&self, date: NaiveDate) -> io::Result<Vec<Reading>> {
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            return Ok(Vec::new());
        };
        let start = midnight.and_utc().timestamp();
        self.range(start, start + SECONDS_PER_DAY - 1)
    }

    /// Most recent reading.
    fn latest(&self) -> io::Result<Option<Reading>> {
        Ok(self.all()?.pop())
    }

    /// Warmest reading since `start`; the earliest one on ties.
    fn max_since(&self, start: i64) -> io::Result<Option<Reading>> {
        Ok(extreme(self.since(start)?, |candidate, best| {
            candidate.temperature() > best.temperature()
        }))
    }

    /// Coldest reading since `start`; the earliest one on ties.
    fn min_since(&self, start: i64) -> io::Result<Option<Reading>> {
        Ok(extreme(self.since(start)?, |candidate, best| {
            candidate.temperature() < best.temperature()
        }))
    }
}

fn extreme(
    readings: Vec<Reading>,
    better: impl Fn(&Reading, &Reading) -> bool,
) -> Option<Reading> {
    readings.into_iter().fold(None, |best, r| match best {
        Some(b) if !better(&r, &b) => Some(b),
        _ => Some(r),
    })
}

/// Keeps readings inside `[start, end]` in timestamp order. The sort is
/// stable, so readings sharing a second keep their arrival order.
fn select(mut readings: Vec<Reading>, start: i64, end: i64) -> Vec<Reading> {
    readings.retain(|r| (start..=end).contains(&r.timestamp()));
    readings.sort_by_key(Reading::timestamp);
    readings
}

/// Newest reading without decoding every chunk.
fn latest_in(view: &StoreView) -> io::Result<Option<Reading>> {
    let from_wal = view
        .wal_readings()
        .into_iter()
        .max_by_key(Reading::timestamp);

    let newest_chunk = view
        .chunks
        .iter()
        .filter_map(|path| {
            let meta = chunk::read_chunk_metadata(path).ok()?;
            Some((meta.last_timestamp, path))
        })
        .max_by_key(|(last, _)| *last);

    let Some((last, path)) = newest_chunk else {
        return Ok(from_wal);
    };
    if let Some(reading) = from_wal
        && reading.timestamp() >= last
    {
        return Ok(Some(reading));
    }
    let from_chunk = chunk::read_chunk(path)?
        .into_iter()
        .max_by_key(Reading::timestamp);
    Ok(from_chunk.or(from_wal))
}

impl ReadingStore {
    /// Captures the files to read while writers are excluded. Decoding
    /// happens after the lock is released so appends are not held up.
    fn view(&self) -> io::Result<StoreView> {
        self.with_lock(StoreView::capture)
    }
}

impl ReadingQuery for ReadingStore {
    fn range(&self, start: i64, end: i64) -> io::Result<Vec<Reading>> {
        let view = self.view()?;
        Ok(select(view.load(start, end), start, end))
    }

    fn latest(&self) -> io::Result<Option<Reading>> {
        latest_in(&self.view()?)
    }
}

/// Read-only view of a data directory.
pub struct ArchiveReader {
    base_path: PathBuf,
}

impl ArchiveReader {
    pub fn open(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        if !base_path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("data directory {} does not exist", base_path.display()),
            ));
        }
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn stats(&self) -> io::Result<StoreStats> {
        manager::directory_stats(&self.base_path)
    }
}

impl ReadingQuery for ArchiveReader {
    fn range(&self, start: i64, end: i64) -> io::Result<Vec<Reading>> {
        let view = StoreView::capture(&self.base_path)?;
        Ok(select(view.load(start, end), start, end))
    }

    fn latest(&self) -> io::Result<Option<Reading>> {
        latest_in(&StoreView::capture(&self.base_path)?)
    }
}
