//! Price-Delta Service
//!
//! Consumes a stream of price ticks and produces, for every new tick, the
//! price change relative to a tick of the same instrument published roughly
//! a fixed lag earlier:
//! - Shared in-memory tick buffer, partitioned by instrument
//! - Retention job bounding the buffer to a time horizon
//! - Delta job matching new ticks against lagged references
//! - Per-instrument CSV / JSON-lines output streams
//! - Market poller and stdin publishers feeding an in-process broker
//!
//! # Architecture
//!
//! ```text
//!  MarketPoller / stdin
//!        │  JSON bodies
//!   ┌────▼────┐
//!   │ Broker  │  ← bounded mpsc channel
//!   └────┬────┘
//!        │
//!   ┌────▼────┐
//!   │ Ingest  │  ← decodes, validates, stamps arrival time
//!   └────┬────┘
//!        │ append
//!  ┌─────▼──────┐   prune    ┌───────────┐
//!  │ TickBuffer │◄───────────│ Retention │
//!  └─────┬──────┘            └───────────┘
//!        │ view
//!   ┌────▼────┐
//!   │ Deltas  │  ← nearest reference within lag ± tolerance
//!   └────┬────┘
//!        │
//!   ┌────▼────┐
//!   │  Sink   │  ← one append-only stream per instrument
//!   └─────────┘
//! ```

pub mod buffer;
pub mod clock;
pub mod config;
pub mod delta;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod publisher;
pub mod retention;
pub mod service;
pub mod sink;

// Library version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
