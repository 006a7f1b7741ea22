//! End-to-end: scripted serial device → ingestion loop → reading store.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use tempmeter_core::config::{BackoffPolicy, FieldLayout, IngestConfig, parse_delimiter};
use tempmeter_core::ingest::{FaultKind, IngestionLoop};
use tempmeter_core::serial::{ConnectError, MockSerial, MockStep};
use tempmeter_core::storage::{ArchiveReader, ReadingQuery, ReadingStore};

fn fast_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.port.read_timeout = Duration::from_millis(5);
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(10),
        multiplier: 2.0,
        jitter: 0.1,
    };
    config
}

fn wait_for(store: &ReadingStore, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.all().unwrap().len() < count && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn readings_survive_disconnects_and_reach_disk() {
    let dir = tempdir().unwrap();
    let store = Arc::new(ReadingStore::open(dir.path()).unwrap());

    let backend = MockSerial::new()
        .fail_opens(1, ConnectError::NotFound("/dev/ttyACM0".into()))
        .session(vec![
            MockStep::data(b"23.5,4"),
            MockStep::data(b"1\n24.1,40\r\n"),
            MockStep::data(b"garbage\n"),
            MockStep::Fail(io::ErrorKind::BrokenPipe),
        ])
        .session(vec![MockStep::data(b"boot banner"), MockStep::data(b"\n25.0\n")]);

    let (mut ingest, faults) = IngestionLoop::new(fast_config(), backend, store.clone()).unwrap();
    let shutdown = ingest.shutdown_signal();
    let handle = std::thread::spawn(move || ingest.run());

    wait_for(&store, 3);
    shutdown.request();
    let stats = handle.join().unwrap();

    assert_eq!(stats.readings, 3);
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.io_failures, 1);
    assert_eq!(stats.reconnects(), 1);
    // "garbage" and the boot banner.
    assert_eq!(stats.parse_errors, 2);

    let kinds: Vec<FaultKind> = faults.try_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FaultKind::ConnectError,
            FaultKind::ParseError,
            FaultKind::IoError,
            FaultKind::ParseError
        ]
    );

    store.flush().unwrap();
    assert_eq!(store.pending_len(), 0);

    let archive = ArchiveReader::open(dir.path()).unwrap();
    let temperatures: Vec<f64> = archive
        .all()
        .unwrap()
        .iter()
        .map(|r| r.temperature())
        .collect();
    assert_eq!(temperatures, vec![23.5, 24.1, 25.0]);
    assert_eq!(archive.all().unwrap()[0].humidity(), Some(41.0));
    assert_eq!(archive.latest().unwrap().unwrap().temperature(), 25.0);
}

#[test]
fn token_delimited_celsius_stream() {
    let dir = tempdir().unwrap();
    let store = Arc::new(ReadingStore::open(dir.path()).unwrap());

    let mut config = fast_config();
    config.framing.delimiter = parse_delimiter(", ").unwrap();
    config.format.layout = "temperature".parse::<FieldLayout>().unwrap();

    let stream = b"23.45 Celsius, 23.50 Celsius, 23.61 Celsius, ";
    let steps = stream.chunks(4).map(MockStep::data).collect();
    let backend = MockSerial::new().session(steps);

    let (mut ingest, _faults) = IngestionLoop::new(config, backend, store.clone()).unwrap();
    let shutdown = ingest.shutdown_signal();
    let handle = std::thread::spawn(move || ingest.run());

    wait_for(&store, 3);
    shutdown.request();
    let stats = handle.join().unwrap();

    assert_eq!(stats.readings, 3);
    assert_eq!(stats.parse_errors, 0);
    let readings = store.all().unwrap();
    assert_eq!(readings[2].temperature(), 23.61);
    assert!(readings.iter().all(|r| r.humidity().is_none()));
}
