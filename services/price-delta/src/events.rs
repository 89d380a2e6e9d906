//! Wire messages carried on the broker
//!
//! A tick message is a JSON object with at least the instrument name, the
//! publisher's timestamp in float Unix seconds, and the price. The market
//! poller forwards the whole market object it fetched, so any other fields
//! are accepted and ignored.
//!
//! ```json
//! {"name": "BTC-PERP", "publish timestamp": 1663000000.25, "price": 20123.5, "bid": 20123.0}
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::errors::TypeError;
use types::ids::InstrumentId;
use types::numeric::{parse_price, price_from_f64};
use types::tick::Tick;
use types::time::secs_to_nanos;

/// Field name of the publisher timestamp on the wire.
pub const PUBLISH_TIMESTAMP_FIELD: &str = "publish timestamp";

/// Price as it appears on the wire: a JSON number or a decimal string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WirePrice {
    Number(f64),
    Text(String),
}

impl WirePrice {
    pub fn to_decimal(&self) -> Result<Decimal, TypeError> {
        match self {
            WirePrice::Number(v) => price_from_f64(*v),
            WirePrice::Text(s) => parse_price(s),
        }
    }
}

/// Tick message body as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMessage {
    #[serde(alias = "instrument")]
    pub name: String,
    /// Float Unix seconds
    #[serde(rename = "publish timestamp", alias = "publish_time")]
    pub publish_timestamp: f64,
    pub price: WirePrice,
}

impl TickMessage {
    pub fn new(name: impl Into<String>, publish_timestamp: f64, price: f64) -> Self {
        Self {
            name: name.into(),
            publish_timestamp,
            price: WirePrice::Number(price),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Validate the message and stamp it with the local arrival time.
    pub fn into_tick(self, ingest_time: i64) -> Result<Tick, TypeError> {
        let instrument = InstrumentId::try_new(self.name)?;
        let publish_time = secs_to_nanos(self.publish_timestamp)?;
        let price = self.price.to_decimal()?;
        Ok(Tick::new(instrument, publish_time, ingest_time, price))
    }
}

/// Envelope returned by the market REST endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
}
