//! Types library for the price-delta service
//!
//! This library provides the core type definitions shared by the ingestion,
//! buffering and delta-computation layers, keeping timestamps and prices in a
//! single deterministic representation across the service.
//!
//! # Conventions
//! - Timestamps are `i64` Unix nanoseconds.
//! - Prices and deltas are `rust_decimal::Decimal`.
//!
//! # Modules
//! - `ids`: Instrument identifiers
//! - `tick`: Observed price samples
//! - `delta`: Computed price-change records
//! - `numeric`: Decimal parsing and rounding rules
//! - `time`: Timestamp conversion and formatting
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod tick;
pub mod delta;
pub mod numeric;
pub mod time;
pub mod errors;

