//! Identifier types for tracked instruments
//!
//! Instruments are identified by the venue's market name (e.g. "BTC-PERP").
//! The buffer partitions history by this identifier, so it must be stable,
//! non-empty and free of whitespace.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::TypeError;

/// Instrument identifier (venue market name)
///
/// Ordered so that per-instrument partitions iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstrumentId(String);

impl InstrumentId {
    /// Create a new InstrumentId from a string
    ///
    /// # Panics
    /// Panics if the name is empty or contains whitespace
    pub fn new(name: impl Into<String>) -> Self {
        match Self::try_new(name) {
            Ok(id) => id,
            Err(err) => panic!("{}", err),
        }
    }

    /// Try to create an InstrumentId, rejecting empty or whitespace names
    pub fn try_new(name: impl Into<String>) -> Result<Self, TypeError> {
        let s = name.into();
        if s.is_empty() {
            return Err(TypeError::InvalidInstrument {
                reason: "name is empty".to_string(),
            });
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TypeError::InvalidInstrument {
                reason: format!("name {:?} contains whitespace or control characters", s),
            });
        }
        Ok(Self(s))
    }

    /// Get the name string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstrumentId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_new(s)
    }
}

impl From<InstrumentId> for String {
    fn from(id: InstrumentId) -> Self {
        id.0
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_id_creation() {
        let id = InstrumentId::new("BTC-PERP");
        assert_eq!(id.as_str(), "BTC-PERP");
        assert_eq!(id.to_string(), "BTC-PERP");
    }

    #[test]
    fn test_instrument_id_rejects_empty() {
        assert!(InstrumentId::try_new("").is_err());
    }

    #[test]
    fn test_instrument_id_rejects_whitespace() {
        assert!(InstrumentId::try_new("BTC PERP").is_err());
        assert!(InstrumentId::try_new("BTC\n").is_err());
    }

    #[test]
    #[should_panic]
    fn test_instrument_id_new_panics_on_invalid() {
        let _ = InstrumentId::new("");
    }

    #[test]
    fn test_instrument_id_serialization() {
        let id = InstrumentId::new("ETH-PERP");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ETH-PERP\"");
        let deserialized: InstrumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_instrument_id_deserialize_rejects_invalid() {
        let result: Result<InstrumentId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_instrument_id_ordering() {
        let mut ids = vec![
            InstrumentId::new("SOL-PERP"),
            InstrumentId::new("BTC-PERP"),
            InstrumentId::new("ETH-PERP"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "BTC-PERP");
        assert_eq!(ids[2].as_str(), "SOL-PERP");
    }
}
