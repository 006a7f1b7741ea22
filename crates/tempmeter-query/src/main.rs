//! tempmeter-query - inspect readings stored by tempmeterd.
//!
//! Reads the data directory without taking it over, so it is safe to run
//! while the daemon is collecting.

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tempmeter_core::Reading;
use tempmeter_core::storage::{ArchiveReader, ReadingQuery, StoreStats};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tempmeter-query", about = "Query stored temperature readings", version)]
struct Cli {
    /// Data directory written by tempmeterd
    #[arg(short, long, env = "TEMPMETER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Most recent reading
    Latest,
    /// Every stored reading
    All,
    /// Readings between two instants, inclusive
    Range {
        /// Unix seconds, RFC 3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD" (UTC)
        #[arg(long, value_parser = parse_time)]
        from: i64,
        #[arg(long, value_parser = parse_time)]
        to: i64,
    },
    /// Readings from an instant until now
    Since {
        #[arg(long, value_parser = parse_time)]
        from: i64,
    },
    /// Readings taken today (UTC)
    Today,
    /// Warmest reading in the last N minutes
    Max {
        #[arg(long, default_value = "5")]
        minutes: u32,
    },
    /// Coldest reading in the last N minutes
    Min {
        #[arg(long, default_value = "5")]
        minutes: u32,
    },
    /// Files, sizes and time span of the data directory
    Stats,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> io::Result<()> {
    let archive = ArchiveReader::open(&cli.data_dir)?;
    let now = Utc::now();

    match &cli.command {
        Command::Latest => print_one(archive.latest()?, cli.json),
        Command::All => print_many(&archive.all()?, cli.json),
        Command::Range { from, to } => print_many(&archive.range(*from, *to)?, cli.json),
        Command::Since { from } => print_many(&archive.since(*from)?, cli.json),
        Command::Today => print_many(&archive.on_date(now.date_naive())?, cli.json),
        Command::Max { minutes } => {
            print_one(archive.max_since(window_start(now, *minutes))?, cli.json)
        }
        Command::Min { minutes } => {
            print_one(archive.min_since(window_start(now, *minutes))?, cli.json)
        }
        Command::Stats => print_stats(&archive.stats()?, cli.json),
    }
    Ok(())
}

// ── Time helpers ─────────────────────────────────────────────────────────────

fn window_start(now: DateTime<Utc>, minutes: u32) -> i64 {
    now.timestamp() - i64::from(minutes) * 60
}

/// Accepts unix seconds, RFC 3339, or a naive UTC date/datetime.
fn parse_time(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp());
    }
    Err(format!("unrecognized time '{}'", s))
}

fn fmt_ts(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ReadingJson {
    timestamp: i64,
    time: String,
    temperature: f64,
    humidity: Option<f64>,
}

impl From<&Reading> for ReadingJson {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.timestamp(),
            time: fmt_ts(r.timestamp()),
            temperature: r.temperature(),
            humidity: r.humidity(),
        }
    }
}

fn format_reading(r: &Reading) -> String {
    let humidity = r
        .humidity()
        .map(|h| format!("{:>6.1}", h))
        .unwrap_or_else(|| format!("{:>6}", "-"));
    format!("{}  {:>8.2}  {}", fmt_ts(r.timestamp()), r.temperature(), humidity)
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn print_one(reading: Option<Reading>, json: bool) {
    if json {
        println!("{}", to_json(&reading.as_ref().map(ReadingJson::from)));
        return;
    }
    match reading {
        Some(r) => println!("{}", format_reading(&r)),
        None => println!("No readings"),
    }
}

fn print_many(readings: &[Reading], json: bool) {
    if json {
        let items: Vec<ReadingJson> = readings.iter().map(ReadingJson::from).collect();
        println!("{}", to_json(&items));
        return;
    }
    if readings.is_empty() {
        println!("No readings");
        return;
    }
    println!("{:<19}  {:>8}  {:>6}", "time (UTC)", "temp", "hum");
    for r in readings {
        println!("{}", format_reading(r));
    }
    println!("{} readings", readings.len());
}

fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}

fn print_stats(stats: &StoreStats, json: bool) {
    if json {
        println!("{}", to_json(stats));
        return;
    }
    println!(
        "Chunks:   {} files, {}, {} readings",
        stats.chunk_files,
        human_bytes(stats.chunk_bytes),
        stats.chunk_readings
    );
    println!(
        "WAL:      {} readings, {}",
        stats.wal_readings,
        human_bytes(stats.wal_bytes)
    );
    match (stats.first_timestamp, stats.last_timestamp) {
        (Some(first), Some(last)) => println!("Span:     {} .. {}", fmt_ts(first), fmt_ts(last)),
        _ => println!("Span:     empty"),
    }
}
