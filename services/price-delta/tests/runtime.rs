//! Runtime tests for the price-delta service
//!
//! Spawns the full service on a paused tokio clock and drives it through
//! the broker channel. Tick timestamps come from a manual clock, interval
//! timers from tokio's virtual time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use price_delta::clock::ManualClock;
use price_delta::config::{EngineConfig, ServiceConfig};
use price_delta::events::TickMessage;
use price_delta::service;
use price_delta::sink::{csv_header, CsvSink, DeltaSink, MemorySink, SinkError};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::sleep;
use types::delta::DeltaRecord;
use types::time::NANOS_PER_SEC;

fn secs(s: i64) -> i64 {
    s * NANOS_PER_SEC
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        engine: EngineConfig::default(),
        channel_capacity: 64,
        ..ServiceConfig::default()
    }
}

async fn send(broker: &mpsc::Sender<Vec<u8>>, name: &str, publish_secs: f64, price: f64) {
    let body = TickMessage::new(name, publish_secs, price).encode().unwrap();
    broker.send(body).await.unwrap();
    // Let the ingestion task pick it up at the current manual time
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_delta() {
    let clock = Arc::new(ManualClock::new(secs(1000)));
    let sink = MemorySink::new();
    let service = service::spawn(test_config(), Box::new(sink.clone()), clock.clone()).unwrap();
    let broker = service.broker();

    clock.set(secs(1001));
    send(&broker, "BTC-PERP", 1000.0, 100.0).await;
    clock.set(secs(1062));
    send(&broker, "BTC-PERP", 1061.0, 105.0).await;
    send(&broker, "ETH-PERP", 1061.0, 10.0).await;
    send(&broker, "ETH-PERP", 0.0, f64::NAN).await;

    clock.set(secs(1063));
    // First delta run fires 5s after start
    sleep(Duration::from_secs(5)).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instrument.as_str(), "BTC-PERP");
    assert_eq!(records[0].delta, Decimal::from(5));

    let metrics = service.metrics();
    assert_eq!(metrics.ticks_ingested.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.ticks_malformed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.deltas_emitted.load(Ordering::Relaxed), 1);

    // Nothing new: later runs stay quiet
    sleep(Duration::from_secs(20)).await;
    assert_eq!(sink.len(), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retention_runs_periodically() {
    let clock = Arc::new(ManualClock::new(secs(10_000)));
    let service = service::spawn(test_config(), Box::new(MemorySink::new()), clock.clone()).unwrap();
    let broker = service.broker();
    let buffer = service.buffer();

    send(&broker, "BTC-PERP", 9_300.0, 1.0).await;
    send(&broker, "BTC-PERP", 9_900.0, 1.0).await;
    assert_eq!(buffer.len(), 2);

    // First retention run fires 20s after start; horizon is now - 600s
    sleep(Duration::from_secs(21)).await;
    assert_eq!(buffer.len(), 1);
    assert_eq!(service.metrics().ticks_pruned.load(Ordering::Relaxed), 1);

    service.shutdown().await;
}

/// Panics on its `panic_on`-th write (1-based), records every other write.
struct PanicOnWrite {
    panic_on: usize,
    writes: Arc<AtomicUsize>,
    inner: MemorySink,
}

impl PanicOnWrite {
    fn new(panic_on: usize, inner: MemorySink) -> Self {
        Self {
            panic_on,
            writes: Arc::new(AtomicUsize::new(0)),
            inner,
        }
    }
}

impl DeltaSink for PanicOnWrite {
    fn write(&mut self, record: &DeltaRecord) -> Result<(), SinkError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.panic_on {
            panic!("sink exploded");
        }
        self.inner.write(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "panic-on-write"
    }
}

#[tokio::test(start_paused = true)]
async fn test_delta_job_survives_panic() {
    let clock = Arc::new(ManualClock::new(secs(1000)));
    let records = MemorySink::new();
    let sink = PanicOnWrite::new(1, records.clone());
    let service = service::spawn(test_config(), Box::new(sink), clock.clone()).unwrap();
    let broker = service.broker();

    clock.set(secs(1001));
    send(&broker, "BTC-PERP", 1000.0, 100.0).await;
    send(&broker, "BTC-PERP", 1060.0, 103.0).await;

    // The panicking run still claimed its interval: the lost record is not retried
    sleep(Duration::from_secs(11)).await;
    assert_eq!(service.metrics().job_panics.load(Ordering::Relaxed), 1);
    assert!(records.is_empty());

    // Later ticks are still processed
    clock.set(secs(1012));
    send(&broker, "BTC-PERP", 1061.0, 104.0).await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records.records()[0].publish_time, secs(1061));
    assert_eq!(records.records()[0].delta, Decimal::from(4));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panic_mid_batch_emits_each_record_at_most_once() {
    let clock = Arc::new(ManualClock::new(secs(1000)));
    let records = MemorySink::new();
    let sink = PanicOnWrite::new(2, records.clone());
    let service = service::spawn(test_config(), Box::new(sink), clock.clone()).unwrap();
    let broker = service.broker();

    clock.set(secs(1001));
    send(&broker, "BTC-PERP", 1000.0, 100.0).await;
    send(&broker, "ETH-PERP", 1000.0, 10.0).await;
    send(&broker, "BTC-PERP", 1060.0, 101.0).await;
    send(&broker, "ETH-PERP", 1060.0, 11.0).await;

    // First run writes BTC, panics on ETH; the following runs must not rescan
    clock.set(secs(1002));
    sleep(Duration::from_secs(21)).await;

    assert_eq!(service.metrics().job_panics.load(Ordering::Relaxed), 1);
    let names: Vec<String> = records.records().iter().map(|r| r.instrument.to_string()).collect();
    assert_eq!(names, vec!["BTC-PERP"]);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_csv() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(secs(1000)));
    let sink = CsvSink::new(dir.path(), Duration::from_secs(60)).unwrap();
    let config = ServiceConfig {
        output_dir: dir.path().to_path_buf(),
        ..test_config()
    };
    let service = service::spawn(config, Box::new(sink), clock.clone()).unwrap();
    let broker = service.broker();

    clock.set(secs(1001));
    send(&broker, "AVAX-PERP", 1000.0, 20.0).await;
    send(&broker, "AVAX-PERP", 1060.0, 21.5).await;
    sleep(Duration::from_secs(6)).await;

    service.shutdown().await;

    let contents = std::fs::read_to_string(dir.path().join("AVAX-PERP.csv")).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines[0], csv_header(Duration::from_secs(60)));
    assert_eq!(lines[1], "AVAX-PERP,1970-01-01 00:17:40.000000,21.5,1.5000");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_publishers() {
    let clock = Arc::new(ManualClock::new(secs(1000)));
    let service = service::spawn(test_config(), Box::new(MemorySink::new()), clock).unwrap();
    let broker = service.broker();
    let mut signal = service.shutdown_signal();

    service.shutdown().await;

    signal.changed().await.unwrap();
    assert!(*signal.borrow());
    assert!(broker.send(b"{}".to_vec()).await.is_err());
}
