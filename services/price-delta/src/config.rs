//! Configuration for the price-delta service
//!
//! All tunables are carried in explicit structures passed at construction;
//! nothing is read from process-wide mutable state once the service starts.

use std::path::PathBuf;
use std::time::Duration;

use types::time::duration_nanos;

/// Markets tracked when no ticker list is given.
pub const DEFAULT_TICKERS: &[&str] = &[
    "BTC-PERP", "ETH-PERP", "AVAX-PERP", "BNB-PERP", "FTT-PERP", "SOL-PERP", "ADA-PERP",
    "ATOM-PERP", "LINK-PERP", "MATIC-PERP", "XMR-PERP", "FTM-PERP", "NEAR-PERP", "SAND-PERP",
    "DOT-PERP", "OP-PERP", "AXS-PERP", "APE-PERP", "WAVES-PERP", "CEL-PERP", "CRV-PERP",
    "GRT-PERP", "AAVE-PERP", "SNX-PERP",
];

/// Default market-data REST endpoint polled by the publisher.
pub const DEFAULT_API_BASE: &str = "https://ftx.com/api";

/// Errors raised while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("tolerance {tolerance:?} must be smaller than target lag {target_lag:?}")]
    ToleranceTooWide {
        tolerance: Duration,
        target_lag: Duration,
    },

    #[error("retention {keep:?} is shorter than the reference window {window:?}")]
    RetentionTooShort { keep: Duration, window: Duration },

    #[error("channel capacity must be greater than zero")]
    ZeroCapacity,

    #[error("no tickers configured")]
    NoTickers,
}

/// Tunables of the delta computation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Desired separation between a tick and its reference tick.
    pub target_lag: Duration,
    /// Allowed deviation from `target_lag` when searching for a reference.
    pub tolerance: Duration,
    /// Retention horizon: ticks published earlier than `now - keep` are pruned.
    pub keep: Duration,
    /// Period of the delta computation job.
    pub calc_interval: Duration,
    /// Period of the retention job.
    pub clean_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_lag: Duration::from_secs(60),
            tolerance: Duration::from_secs(10),
            keep: Duration::from_secs(600),
            calc_interval: Duration::from_secs(5),
            clean_interval: Duration::from_secs(20),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("target_lag", self.target_lag),
            ("calc_interval", self.calc_interval),
            ("clean_interval", self.clean_interval),
            ("keep", self.keep),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        // A window reaching zero lag would let a tick match itself or newer ticks.
        if self.tolerance >= self.target_lag {
            return Err(ConfigError::ToleranceTooWide {
                tolerance: self.tolerance,
                target_lag: self.target_lag,
            });
        }

        let window = self.target_lag + self.tolerance;
        if self.keep < window {
            return Err(ConfigError::RetentionTooShort {
                keep: self.keep,
                window,
            });
        }

        Ok(())
    }

    /// Inclusive `[lo, hi]` publish-time bounds of the reference search for
    /// a tick published at `publish_time`.
    pub fn search_bounds(&self, publish_time: i64) -> (i64, i64) {
        let lag = duration_nanos(self.target_lag);
        let tolerance = duration_nanos(self.tolerance);
        (
            publish_time.saturating_sub(lag.saturating_add(tolerance)),
            publish_time.saturating_sub(lag.saturating_sub(tolerance)),
        )
    }

    /// Ideal reference publish time for a tick published at `publish_time`.
    pub fn reference_target(&self, publish_time: i64) -> i64 {
        publish_time.saturating_sub(duration_nanos(self.target_lag))
    }
}

/// Output stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Comma-separated values with a header row
    #[default]
    Csv,
    /// One JSON object per line
    Jsonl,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Jsonl => "jsonl",
        }
    }
}

/// Configuration for the market poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Base URL; markets are fetched from `{api_base}/markets/{ticker}`.
    pub api_base: String,
    /// Tickers polled each round, in order.
    pub tickers: Vec<String>,
    /// Retries after the first failed attempt before skipping a ticker.
    pub max_retries: u32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Pause between retries of the same ticker.
    pub retry_delay: Duration,
    /// Pause after each full round over all tickers.
    pub round_pause: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            tickers: DEFAULT_TICKERS.iter().map(|t| t.to_string()).collect(),
            max_retries: 5,
            request_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            round_pause: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tickers.is_empty() {
            return Err(ConfigError::NoTickers);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "request_timeout",
            });
        }
        Ok(())
    }

    /// URL of the market endpoint for `ticker`.
    pub fn market_url(&self, ticker: &str) -> String {
        format!("{}/markets/{}", self.api_base.trim_end_matches('/'), ticker)
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    /// Directory holding one output stream per instrument.
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    /// Capacity of the in-process broker channel (messages).
    pub channel_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            output_dir: PathBuf::from("output"),
            output_format: OutputFormat::Csv,
            channel_capacity: 10_000,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}
