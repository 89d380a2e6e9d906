//! Tick publishers feeding the broker channel
//!
//! `MarketPoller` polls the exchange REST API ticker by ticker and publishes
//! each market object, stamped with its publish time. `relay_lines` forwards
//! JSON lines from any async reader (stdin in the binary), which is handy for
//! replaying captured messages.

use std::sync::Arc;

use reqwest::{Client, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use types::time::nanos_to_secs;

use crate::clock::Clock;
use crate::config::PublisherConfig;
use crate::events::{MarketResponse, PUBLISH_TIMESTAMP_FIELD};
use crate::metrics::ServiceMetrics;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("response has no result object")]
    MissingResult,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker channel closed")]
    ChannelClosed,
}

/// Add the publish timestamp to a market object and encode it as a message body.
pub fn stamp_market(response: MarketResponse, publish_time: i64) -> Result<Vec<u8>, PublishError> {
    let mut market = response.result.ok_or(PublishError::MissingResult)?;
    market.insert(
        PUBLISH_TIMESTAMP_FIELD.to_string(),
        serde_json::Value::from(nanos_to_secs(publish_time)),
    );
    Ok(serde_json::to_vec(&market)?)
}

/// Polls `{api_base}/markets/{ticker}` for every configured ticker, in rounds.
pub struct MarketPoller {
    client: Client,
    config: PublisherConfig,
    broker: mpsc::Sender<Vec<u8>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
}

impl MarketPoller {
    pub fn new(
        config: PublisherConfig,
        broker: mpsc::Sender<Vec<u8>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        info!(
            api_base = %config.api_base,
            tickers = config.tickers.len(),
            max_retries = config.max_retries,
            "MarketPoller initialized"
        );

        Ok(Self {
            client,
            config,
            broker,
            clock,
            metrics,
        })
    }

    /// Fetch one market and return the stamped message body.
    pub async fn fetch_market(&self, ticker: &str) -> Result<Vec<u8>, PublishError> {
        let response = self.client.get(self.config.market_url(ticker)).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PublishError::Status(status.as_u16()));
        }

        let body: MarketResponse = response.json().await?;
        stamp_market(body, self.clock.now())
    }

    /// Fetch and publish one ticker, retrying failed requests.
    ///
    /// Returns `Ok(false)` when the ticker was skipped after exhausting its
    /// retries. Only a closed broker channel is an error.
    pub async fn publish_ticker(&self, ticker: &str) -> Result<bool, PublishError> {
        let mut attempt: u32 = 0;
        loop {
            match self.fetch_market(ticker).await {
                Ok(body) => {
                    self.broker
                        .send(body)
                        .await
                        .map_err(|_| PublishError::ChannelClosed)?;
                    self.metrics.record_published();
                    debug!(ticker, "Published market tick");
                    return Ok(true);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        ticker,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Market request failed, retrying"
                    );
                    sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    self.metrics.record_publish_failure();
                    warn!(ticker, error = %e, "Max retries reached, skipping ticker");
                    return Ok(false);
                }
            }
        }
    }

    /// One pass over every ticker. Returns how many were published.
    pub async fn run_round(&self) -> Result<usize, PublishError> {
        let mut published = 0;
        for ticker in &self.config.tickers {
            if self.publish_ticker(ticker).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    /// Poll in rounds until shutdown or until the broker goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("MarketPoller started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let round = tokio::select! {
                round = self.run_round() => round,
                _ = shutdown.changed() => break,
            };

            match round {
                Ok(published) => debug!(
                    published,
                    tickers = self.config.tickers.len(),
                    "Polling round complete"
                ),
                Err(e) => {
                    error!(error = %e, "Stopping publisher");
                    break;
                }
            }

            tokio::select! {
                _ = sleep(self.config.round_pause) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("MarketPoller stopped");
    }
}

/// Forward non-empty lines from `reader` to the broker until EOF or shutdown.
///
/// Returns the number of lines relayed.
pub async fn relay_lines<R>(
    reader: R,
    broker: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut relayed = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if broker.send(line.as_bytes().to_vec()).await.is_err() {
                        warn!("Broker channel closed, stopping line relay");
                        break;
                    }
                    relayed += 1;
                }
                Ok(None) => {
                    info!(relayed, "Input exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    relayed
}
