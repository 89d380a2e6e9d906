//! Price tick type
//!
//! A tick is one observed price sample for an instrument. It carries two
//! clocks: the publisher's timestamp (used for window search and retention)
//! and the local arrival timestamp (used for incremental scanning).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::InstrumentId;

/// One observed price sample. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: InstrumentId,
    /// Publisher timestamp (Unix nanos)
    pub publish_time: i64,
    /// Local arrival timestamp (Unix nanos), stamped by the ingestion layer
    pub ingest_time: i64,
    pub price: Decimal,
}

impl Tick {
    pub fn new(
        instrument: InstrumentId,
        publish_time: i64,
        ingest_time: i64,
        price: Decimal,
    ) -> Self {
        Self {
            instrument,
            publish_time,
            ingest_time,
            price,
        }
    }

    /// Distance from `target` to this tick's publish time, in nanoseconds.
    pub fn distance_to(&self, target: i64) -> u64 {
        self.publish_time.abs_diff(target)
    }
}
