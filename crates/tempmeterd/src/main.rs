//! tempmeterd - serial temperature collector daemon.
//!
//! Reads readings from a microcontroller on a serial port and stores them to
//! disk. Supports hourly file segmentation and automatic rotation by size
//! and age.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use clap::Parser;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tempmeter_core::config::{
    AdcScaling, BackoffPolicy, ConfigError, DataBits, FieldLayout, FlowControl, FormatConfig,
    FrameConfig, IngestConfig, Parity, PortConfig, StopBits, ValueRange, parse_delimiter,
};
use tempmeter_core::ingest::{FaultEvent, FaultKind, IngestionLoop};
use tempmeter_core::serial::{RealSerial, list_ports};
use tempmeter_core::storage::{ReadingStore, RotationConfig, RotationResult};

/// Serial temperature collector daemon.
#[derive(Parser)]
#[command(name = "tempmeterd", about = "Serial temperature collector daemon", version)]
struct Args {
    /// Serial port to read from.
    #[arg(short, long, env = "TEMPMETER_PORT", default_value = "/dev/ttyACM0")]
    port: String,

    /// Baud rate.
    #[arg(short, long, env = "TEMPMETER_BAUD", default_value = "9600")]
    baud: u32,

    /// Parity: none, odd or even.
    #[arg(long, env = "TEMPMETER_PARITY", default_value = "none")]
    parity: Parity,

    /// Data bits: 5, 6, 7 or 8.
    #[arg(long, env = "TEMPMETER_DATA_BITS", default_value = "8")]
    data_bits: DataBits,

    /// Stop bits: 1 or 2.
    #[arg(long, env = "TEMPMETER_STOP_BITS", default_value = "1")]
    stop_bits: StopBits,

    /// Flow control: none, software or hardware.
    #[arg(long, env = "TEMPMETER_FLOW_CONTROL", default_value = "none")]
    flow_control: FlowControl,

    /// Per-read timeout in milliseconds.
    #[arg(long, env = "TEMPMETER_READ_TIMEOUT_MS", default_value = "500")]
    read_timeout_ms: u64,

    /// Maximum bytes per read.
    #[arg(long, env = "TEMPMETER_CHUNK_SIZE", default_value = "1024")]
    chunk_size: usize,

    /// Frame delimiter. Escapes \n \r \t \0 \\ and \xNN are understood.
    #[arg(long, env = "TEMPMETER_DELIMITER", default_value = "\\n")]
    delimiter: String,

    /// Longest accepted frame in bytes (delimiter excluded).
    #[arg(long, env = "TEMPMETER_MAX_FRAME_LEN", default_value = "256")]
    max_frame_len: usize,

    /// Separator between fields of a frame.
    #[arg(long, env = "TEMPMETER_SEPARATOR", default_value = ",")]
    separator: String,

    /// Field layout, e.g. "temperature,humidity?" or "ignore,temperature".
    #[arg(long, env = "TEMPMETER_LAYOUT", default_value = "temperature,humidity?")]
    layout: FieldLayout,

    /// Plausible temperature range, inclusive.
    #[arg(
        long,
        env = "TEMPMETER_TEMP_RANGE",
        default_value = "-40..125",
        allow_hyphen_values = true
    )]
    temp_range: ValueRange,

    /// Plausible humidity range, inclusive.
    #[arg(
        long,
        env = "TEMPMETER_HUMIDITY_RANGE",
        default_value = "0..100",
        allow_hyphen_values = true
    )]
    humidity_range: ValueRange,

    /// Treat the temperature field as a raw ADC count: "tmp36", "tmp36:VREF"
    /// or "VREF:ADC_MAX:OFFSET_V:UNITS_PER_V".
    #[arg(long, env = "TEMPMETER_ADC")]
    adc: Option<AdcScaling>,

    /// First reconnect delay in milliseconds.
    #[arg(long, env = "TEMPMETER_BACKOFF_INITIAL_MS", default_value = "500")]
    backoff_initial_ms: u64,

    /// Longest reconnect delay in milliseconds.
    #[arg(long, env = "TEMPMETER_BACKOFF_MAX_MS", default_value = "30000")]
    backoff_max_ms: u64,

    /// Growth factor between consecutive reconnect delays.
    #[arg(long, env = "TEMPMETER_BACKOFF_MULTIPLIER", default_value = "2.0")]
    backoff_multiplier: f64,

    /// Random extra delay as a fraction of the base delay, in [0, 1).
    #[arg(long, env = "TEMPMETER_BACKOFF_JITTER", default_value = "0.2")]
    backoff_jitter: f64,

    /// How long a reading may wait for storage before it is dropped.
    #[arg(long, env = "TEMPMETER_SINK_TIMEOUT_MS", default_value = "2000")]
    sink_timeout_ms: u64,

    /// Fault events buffered for the supervisor.
    #[arg(long, env = "TEMPMETER_FAULT_QUEUE", default_value = "256")]
    fault_queue: usize,

    /// Output directory for storing readings.
    #[arg(short, long, env = "TEMPMETER_DATA_DIR", default_value = "./data")]
    data_dir: String,

    /// Readings per chunk before an early flush.
    #[arg(long, default_value = "3600")]
    chunk_readings: usize,

    /// Maximum total size of data files (e.g., "1G", "500M", "1073741824").
    /// When exceeded, oldest files are removed.
    #[arg(long, default_value = "256M", value_parser = parse_size)]
    max_size: u64,

    /// Maximum retention period in days. Files older than this are removed.
    #[arg(long, default_value = "30")]
    max_days: u32,

    /// Seconds between status lines.
    #[arg(long, default_value = "300")]
    stats_interval: u64,

    /// List serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K") into bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Formats bytes as human-readable size string.
fn format_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["tempmeterd", "tempmeter_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> Result<IngestConfig, ConfigError> {
    let config = IngestConfig {
        port: PortConfig {
            port: args.port.clone(),
            baud_rate: args.baud,
            parity: args.parity,
            data_bits: args.data_bits,
            stop_bits: args.stop_bits,
            flow_control: args.flow_control,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            chunk_size: args.chunk_size,
        },
        framing: FrameConfig {
            delimiter: parse_delimiter(&args.delimiter)?,
            max_frame_len: args.max_frame_len,
        },
        format: FormatConfig {
            separator: args.separator.clone(),
            layout: args.layout.clone(),
            temperature_range: args.temp_range,
            humidity_range: args.humidity_range,
            adc: args.adc,
        },
        backoff: BackoffPolicy {
            initial: Duration::from_millis(args.backoff_initial_ms),
            max: Duration::from_millis(args.backoff_max_ms),
            multiplier: args.backoff_multiplier,
            jitter: args.backoff_jitter,
        },
        sink_timeout: Duration::from_millis(args.sink_timeout_ms),
        fault_queue_capacity: args.fault_queue,
    };
    config.validate()?;
    Ok(config)
}

/// Per-kind fault counts since startup.
#[derive(Default)]
struct FaultTally {
    counts: HashMap<FaultKind, u64>,
}

impl FaultTally {
    fn record(&mut self, event: &FaultEvent) {
        *self.counts.entry(event.kind).or_insert(0) += 1;
    }

    fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    fn summary(&self) -> String {
        let parts: Vec<String> = FaultKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.counts.get(kind).copied().unwrap_or(0);
                (count > 0).then(|| format!("{}={}", kind, count))
            })
            .collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    }
}

fn log_rotation(prefix: &str, result: &RotationResult) {
    if result.files_removed_by_age > 0 || result.files_removed_by_size > 0 {
        info!(
            "{}: removed {} by age, {} by size, freed {}, {} files remaining ({})",
            prefix,
            result.files_removed_by_age,
            result.files_removed_by_size,
            format_size(result.bytes_freed),
            result.files_remaining,
            format_size(result.total_size_after)
        );
    }
}

fn print_ports() -> Result<(), Box<dyn std::error::Error>> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for (name, description) in ports {
        println!("{:<24} {}", name, description);
    }
    Ok(())
}

fn drain_faults(faults: &Receiver<FaultEvent>, tally: &mut FaultTally, wait: Duration) {
    match faults.recv_timeout(wait) {
        Ok(event) => {
            tally.record(&event);
            for event in faults.try_iter() {
                tally.record(&event);
            }
        }
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let rotation_config = RotationConfig::new(args.max_size, args.max_days);

    info!("tempmeterd {} starting", env!("CARGO_PKG_VERSION"));
    info!("Port: {}", config.port);
    info!("Framing: {}", config.framing);
    info!("Format: {}", config.format);
    info!(
        "Backoff: {}, sink_timeout={}ms",
        config.backoff,
        config.sink_timeout.as_millis()
    );
    info!(
        "Rotation policy: max_size={}, max_days={}",
        format_size(args.max_size),
        args.max_days
    );

    let store =
        Arc::new(ReadingStore::open(&args.data_dir)?.with_chunk_size_limit(args.chunk_readings));
    info!("Storage initialized at {}", args.data_dir);

    match store.rotate(&rotation_config) {
        Ok(result) => {
            log_rotation("Initial rotation", &result);
            info!(
                "Storage status: {} files, {}",
                result.files_remaining,
                format_size(result.total_size_after)
            );
        }
        Err(e) => error!("Initial rotation failed: {}", e),
    }

    let (mut ingest, faults) = IngestionLoop::new(config, RealSerial::new(), store.clone())?;
    let shutdown = ingest.shutdown_signal();

    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        signal.request();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let ingest_thread = std::thread::Builder::new()
        .name("tempmeter-ingest".into())
        .spawn(move || ingest.run())?;

    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    let mut last_stats = Instant::now();
    let mut last_rotation_hour = Some(Utc::now().hour());
    let mut tally = FaultTally::default();

    while !shutdown.is_requested() && !ingest_thread.is_finished() {
        drain_faults(&faults, &mut tally, Duration::from_millis(100));

        // Run rotation when hour changes
        let current_hour = Utc::now().hour();
        if last_rotation_hour != Some(current_hour) {
            last_rotation_hour = Some(current_hour);
            match store.rotate(&rotation_config) {
                Ok(result) => log_rotation("Rotation", &result),
                Err(e) => error!("Rotation failed: {}", e),
            }
        }

        if last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            info!(
                "Status: {} readings pending in WAL, faults: {}",
                store.pending_len(),
                tally.summary()
            );
        }
    }

    info!("Shutting down...");
    shutdown.request();
    match ingest_thread.join() {
        Ok(stats) => info!("Ingestion finished: {}", stats),
        Err(_) => error!("Ingestion thread panicked"),
    }
    for event in faults.try_iter() {
        tally.record(&event);
    }
    debug!("{} fault events total", tally.total());

    let pending = store.pending_len();
    if pending > 0 {
        info!("Flushing {} pending readings...", pending);
        match store.flush() {
            Ok(_) => info!("Chunk flushed successfully"),
            Err(e) => error!("Failed to flush chunk on shutdown: {}", e),
        }
    }

    info!("Shutdown complete (faults: {})", tally.summary());
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let result = if args.list_ports {
        print_ports()
    } else {
        run(args)
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
