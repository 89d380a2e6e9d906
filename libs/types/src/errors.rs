//! Error types for the shared domain types
//!
//! Validation failures raised while constructing ticks from raw input.

use thiserror::Error;

/// Errors raised when raw values cannot become domain types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    #[error("Invalid instrument: {reason}")]
    InvalidInstrument { reason: String },

    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },

    #[error("Invalid price: {value}")]
    InvalidPrice { value: String },
}
