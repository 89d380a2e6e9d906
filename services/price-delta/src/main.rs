//! Price-Delta Service binary
//!
//! Wires a publisher (market poller or stdin) to the delta engine and writes
//! one output stream per instrument.
//!
//! Usage:
//!   price-delta --output-dir output --format csv
//!   cat captured.jsonl | price-delta --source stdin
//!
//! Environment Variables:
//!   PRICE_DELTA_TICKERS - Comma-separated tickers (default: 24 perpetual futures)
//!   PRICE_DELTA_API_BASE - Market data REST endpoint
//!   PRICE_DELTA_OUTPUT_DIR - Output directory (default: output)
//!   PRICE_DELTA_LOG_LEVEL - Log level (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use price_delta::clock::{Clock, SystemClock};
use price_delta::config::{
    EngineConfig, OutputFormat, PublisherConfig, ServiceConfig, DEFAULT_API_BASE, DEFAULT_TICKERS,
};
use price_delta::metrics::{AlertMonitor, AlertThresholds};
use price_delta::publisher::{relay_lines, MarketPoller};
use price_delta::service;
use price_delta::sink::open_sink;
use price_delta::SERVICE_VERSION;
use types::ids::InstrumentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Poll the market data REST API
    Poll,
    /// Relay JSON lines from stdin
    Stdin,
}

#[derive(Parser, Debug)]
#[command(name = "price-delta")]
#[command(about = "Emits per-instrument price changes over a fixed lag")]
struct Args {
    /// Tickers to poll and pre-create output streams for
    #[arg(long, env = "PRICE_DELTA_TICKERS", value_delimiter = ',')]
    tickers: Vec<String>,

    /// Market data REST endpoint
    #[arg(long, env = "PRICE_DELTA_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Where ticks come from
    #[arg(long, value_enum, env = "PRICE_DELTA_SOURCE", default_value_t = Source::Poll)]
    source: Source,

    /// Directory for the per-instrument output streams
    #[arg(long, env = "PRICE_DELTA_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Output stream format
    #[arg(long, value_enum, env = "PRICE_DELTA_FORMAT", default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Desired lag between a tick and its reference, in seconds
    #[arg(long, env = "PRICE_DELTA_TARGET_LAG_SECS", default_value = "60")]
    target_lag_secs: u64,

    /// Allowed deviation from the target lag, in seconds
    #[arg(long, env = "PRICE_DELTA_TOLERANCE_SECS", default_value = "10")]
    tolerance_secs: u64,

    /// Retention horizon, in seconds
    #[arg(long, env = "PRICE_DELTA_KEEP_SECS", default_value = "600")]
    keep_secs: u64,

    /// Delta job period, in seconds
    #[arg(long, env = "PRICE_DELTA_CALC_INTERVAL_SECS", default_value = "5")]
    calc_interval_secs: u64,

    /// Retention job period, in seconds
    #[arg(long, env = "PRICE_DELTA_CLEAN_INTERVAL_SECS", default_value = "20")]
    clean_interval_secs: u64,

    /// Broker channel capacity, in messages
    #[arg(long, env = "PRICE_DELTA_CHANNEL_CAPACITY", default_value = "10000")]
    channel_capacity: usize,

    /// Retries per ticker before it is skipped for the round
    #[arg(long, env = "PRICE_DELTA_MAX_RETRIES", default_value = "5")]
    max_retries: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "PRICE_DELTA_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            engine: EngineConfig {
                target_lag: Duration::from_secs(self.target_lag_secs),
                tolerance: Duration::from_secs(self.tolerance_secs),
                keep: Duration::from_secs(self.keep_secs),
                calc_interval: Duration::from_secs(self.calc_interval_secs),
                clean_interval: Duration::from_secs(self.clean_interval_secs),
            },
            output_dir: self.output_dir.clone(),
            output_format: self.format,
            channel_capacity: self.channel_capacity,
        }
    }

    fn publisher_config(&self) -> PublisherConfig {
        let tickers = if self.tickers.is_empty() {
            DEFAULT_TICKERS.iter().map(|t| t.to_string()).collect()
        } else {
            self.tickers.clone()
        };

        PublisherConfig {
            api_base: self.api_base.clone(),
            tickers,
            max_retries: self.max_retries,
            ..PublisherConfig::default()
        }
    }
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    info!(version = SERVICE_VERSION, "Starting price-delta service");

    let config = args.service_config();
    config.validate()?;
    let publisher_config = args.publisher_config();
    publisher_config.validate()?;

    // Output streams for known tickers exist before the first delta
    let instruments = publisher_config
        .tickers
        .iter()
        .map(|t| InstrumentId::try_new(t.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut sink = open_sink(config.output_format, &config.output_dir, config.engine.target_lag)?;
    sink.prepare(&instruments)?;
    info!(
        dir = %config.output_dir.display(),
        format = sink.backend_type(),
        streams = instruments.len(),
        "Output streams ready"
    );

    let thresholds = AlertThresholds::for_engine(&config.engine);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = service::spawn(config, sink, Arc::clone(&clock))?;
    let metrics = service.metrics();

    let publisher = match args.source {
        Source::Poll => {
            let poller = MarketPoller::new(publisher_config, service.broker(), clock, service.metrics())?;
            tokio::spawn(poller.run(service.shutdown_signal()))
        }
        Source::Stdin => {
            let reader = BufReader::new(tokio::io::stdin());
            let broker = service.broker();
            let shutdown = service.shutdown_signal();
            tokio::spawn(async move {
                relay_lines(reader, broker, shutdown).await;
            })
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    service.shutdown().await;
    if let Err(e) = publisher.await {
        warn!(error = %e, "Publisher ended abnormally");
    }

    // Lifetime totals against the per-check thresholds
    for alert in AlertMonitor::new(thresholds).check(&metrics) {
        alert.log();
    }

    Ok(())
}
