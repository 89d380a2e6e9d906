//! Tick ingestion layer
//!
//! Decodes broker message bodies, validates them, stamps the local arrival
//! time and appends the resulting tick to the shared buffer.
//!
//! Malformed messages never reach the buffer: they are logged, counted and
//! dropped. Duplicates and out-of-order publish times are accepted as-is.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::errors::TypeError;
use types::tick::Tick;

use crate::buffer::TickBuffer;
use crate::clock::Clock;
use crate::events::TickMessage;
use crate::metrics::ServiceMetrics;

/// Errors that can occur during tick ingestion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestionError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid tick: {0}")]
    Invalid(#[from] TypeError),
}

/// Turns broker messages into buffered ticks.
pub struct Ingester {
    buffer: Arc<TickBuffer>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
    /// Total ticks accepted.
    ticks_accepted: u64,
    /// Total messages dropped as malformed.
    ticks_dropped: u64,
}

impl Ingester {
    pub fn new(buffer: Arc<TickBuffer>, clock: Arc<dyn Clock>, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            buffer,
            clock,
            metrics,
            ticks_accepted: 0,
            ticks_dropped: 0,
        }
    }

    /// Ingest one raw message body.
    ///
    /// The arrival time is stamped by the buffer under its write lock.
    pub fn ingest(&mut self, body: &[u8]) -> Result<Tick, IngestionError> {
        let tick = TickMessage::decode(body)
            .map_err(|e| IngestionError::Malformed(e.to_string()))
            .and_then(|msg| msg.into_tick(self.clock.now()).map_err(IngestionError::from));

        match tick {
            Ok(tick) => {
                let tick = self.buffer.append_stamped(tick, self.clock.as_ref());
                debug!(
                    instrument = %tick.instrument,
                    publish_time = tick.publish_time,
                    ingest_time = tick.ingest_time,
                    price = %tick.price,
                    "Tick accepted"
                );
                self.ticks_accepted += 1;
                self.metrics.record_tick_ingested();
                Ok(tick)
            }
            Err(err) => {
                self.drop_message(&err, body);
                Err(err)
            }
        }
    }

    /// Consume the broker channel until it closes or shutdown is signalled.
    ///
    /// Messages already queued when shutdown arrives are drained first.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
        info!("Ingestion relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(body) => {
                        let _ = self.ingest(&body);
                    }
                    None => {
                        info!("Broker channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        rx.close();
        while let Ok(body) = rx.try_recv() {
            let _ = self.ingest(&body);
        }

        info!(
            accepted = self.ticks_accepted,
            dropped = self.ticks_dropped,
            "Ingestion relay stopped"
        );
    }

    pub fn ticks_accepted(&self) -> u64 {
        self.ticks_accepted
    }

    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped
    }

    fn drop_message(&mut self, err: &IngestionError, body: &[u8]) {
        self.ticks_dropped += 1;
        self.metrics.record_tick_malformed();
        warn!(
            error = %err,
            body = %String::from_utf8_lossy(body),
            "Dropping malformed tick"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;
    use types::ids::InstrumentId;
    use types::time::NANOS_PER_SEC;

    fn make_ingester(now_secs: i64) -> (Ingester, Arc<TickBuffer>, Arc<ServiceMetrics>) {
        let buffer = Arc::new(TickBuffer::new());
        let metrics = Arc::new(ServiceMetrics::new());
        let clock = Arc::new(ManualClock::new(now_secs * NANOS_PER_SEC));
        let ingester = Ingester::new(Arc::clone(&buffer), clock, Arc::clone(&metrics));
        (ingester, buffer, metrics)
    }

    #[test]
    fn test_ingest_stamps_arrival_time() {
        let (mut ingester, buffer, metrics) = make_ingester(2000);

        let body = TickMessage::new("BTC-PERP", 1000.0, 100.0).encode().unwrap();
        let tick = ingester.ingest(&body).unwrap();

        assert_eq!(tick.publish_time, 1000 * NANOS_PER_SEC);
        assert_eq!(tick.ingest_time, 2000 * NANOS_PER_SEC);
        assert_eq!(tick.price, Decimal::from(100));
        assert_eq!(buffer.len(), 1);
        assert_eq!(ingester.ticks_accepted(), 1);
        assert_eq!(metrics.ticks_ingested.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_is_dropped() {
        let (mut ingester, buffer, metrics) = make_ingester(2000);

        let result = ingester.ingest(b"{\"name\":\"BTC-PERP\"}");
        assert!(matches!(result, Err(IngestionError::Malformed(_))));

        let result = ingester.ingest(br#"{"name":"BTC-PERP","publish timestamp":1,"price":"x"}"#);
        assert!(matches!(result, Err(IngestionError::Invalid(_))));

        assert!(buffer.is_empty());
        assert_eq!(ingester.ticks_dropped(), 2);
        assert_eq!(metrics.ticks_malformed.load(Ordering::Relaxed), 2);
    }

    /// Log sink shared with a test subscriber.
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_tick_logs_its_body() {
        let (mut ingester, _, _) = make_ingester(2000);
        let logs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = Arc::clone(&logs);
                move || Captured(Arc::clone(&logs))
            })
            .finish();

        // Decodes fine, fails validation on the price
        let body = br#"{"name":"BTC-PERP","publish timestamp":1,"price":"x"}"#;
        tracing::subscriber::with_default(subscriber, || {
            assert!(ingester.ingest(body).is_err());
        });

        let output = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Dropping malformed tick"));
        assert!(output.contains(r#""price":"x""#));
    }

    #[test]
    fn test_stamp_follows_sealed_scan() {
        let (mut ingester, buffer, _) = make_ingester(2000);
        // A scan already claimed arrivals up to 2005
        buffer.seal(2005 * NANOS_PER_SEC);

        let body = TickMessage::new("BTC-PERP", 1000.0, 100.0).encode().unwrap();
        let tick = ingester.ingest(&body).unwrap();

        assert_eq!(tick.ingest_time, 2005 * NANOS_PER_SEC + 1);
        assert_eq!(buffer.query_ingested_since(2005 * NANOS_PER_SEC, i64::MAX), vec![tick]);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let (mut ingester, buffer, _) = make_ingester(2000);
        let body = TickMessage::new("BTC-PERP", 1000.0, 100.0).encode().unwrap();
        ingester.ingest(&body).unwrap();
        ingester.ingest(&body).unwrap();

        let ticks = buffer.query_range(&InstrumentId::new("BTC-PERP"), 0, i64::MAX);
        assert_eq!(ticks.len(), 2);
    }

    #[tokio::test]
    async fn test_relay_drains_on_close() {
        let (ingester, buffer, _) = make_ingester(2000);
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..5 {
            let body = TickMessage::new("ETH-PERP", 1000.0 + i as f64, 10.0).encode().unwrap();
            tx.send(body).await.unwrap();
        }
        tx.send(b"garbage".to_vec()).await.unwrap();
        drop(tx);

        ingester.run(rx, shutdown_rx).await;
        assert_eq!(buffer.len(), 5);
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let (ingester, buffer, _) = make_ingester(2000);
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(ingester.run(rx, shutdown_rx));
        tx.send(TickMessage::new("BTC-PERP", 1000.0, 1.0).encode().unwrap())
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // The queued message is drained before exit
        assert_eq!(buffer.len(), 1);
        assert!(tx.is_closed());
    }
}
