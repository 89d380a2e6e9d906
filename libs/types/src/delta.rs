//! Price-change record type
//!
//! A delta record pairs a freshly ingested tick with the historical reference
//! tick chosen for it and carries the rounded price difference.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::InstrumentId;
use crate::numeric::round_delta;
use crate::tick::Tick;

/// Computed price change for one tick. Written once to a sink, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub instrument: InstrumentId,
    /// Publish time of the tick this record describes (Unix nanos)
    pub publish_time: i64,
    /// Price of the tick this record describes
    pub price: Decimal,
    /// `price - reference.price`, rounded to `numeric::DELTA_SCALE` places
    pub delta: Decimal,
    /// Publish time of the matched reference tick (Unix nanos)
    pub reference_time: i64,
}

impl DeltaRecord {
    /// Build the record for `tick` against its chosen `reference`.
    pub fn from_match(tick: &Tick, reference: &Tick) -> Self {
        Self {
            instrument: tick.instrument.clone(),
            publish_time: tick.publish_time,
            price: tick.price,
            delta: round_delta(tick.price - reference.price),
            reference_time: reference.publish_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NANOS_PER_SEC;

    fn tick(secs: i64, price: &str) -> Tick {
        Tick::new(
            InstrumentId::new("BTC-PERP"),
            secs * NANOS_PER_SEC,
            secs * NANOS_PER_SEC,
            Decimal::from_str_exact(price).unwrap(),
        )
    }

    #[test]
    fn test_from_match() {
        let reference = tick(1000, "100");
        let current = tick(1061, "105");

        let record = DeltaRecord::from_match(&current, &reference);
        assert_eq!(record.instrument.as_str(), "BTC-PERP");
        assert_eq!(record.publish_time, 1061 * NANOS_PER_SEC);
        assert_eq!(record.price, Decimal::from(105));
        assert_eq!(record.delta, Decimal::from(5));
        assert_eq!(record.reference_time, 1000 * NANOS_PER_SEC);
        assert_eq!(record.delta.to_string(), "5.0000");
    }

    #[test]
    fn test_delta_is_rounded() {
        let reference = tick(1000, "0.100001");
        let current = tick(1060, "0.2");

        let record = DeltaRecord::from_match(&current, &reference);
        assert_eq!(record.delta, Decimal::from_str_exact("0.1").unwrap());
    }

    #[test]
    fn test_negative_delta() {
        let reference = tick(1000, "105.5");
        let current = tick(1060, "100.25");

        let record = DeltaRecord::from_match(&current, &reference);
        assert_eq!(record.delta, Decimal::from_str_exact("-5.25").unwrap());
    }

    #[test]
    fn test_record_serialization() {
        let record = DeltaRecord::from_match(&tick(1061, "105"), &tick(1000, "100"));
        let json = serde_json::to_string(&record).unwrap();
        let deserialized: DeltaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, deserialized);
    }
}
