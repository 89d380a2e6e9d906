//! Retention job
//!
//! Bounds the buffer by pruning every tick published before `now - keep`.
//! Enforcement is eventual: between runs the buffer may hold ticks up to
//! one `clean_interval` past the horizon.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use types::time::duration_nanos;

use crate::buffer::TickBuffer;
use crate::metrics::ServiceMetrics;

/// Outcome of one retention run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSummary {
    pub horizon: i64,
    pub pruned: usize,
    pub remaining: usize,
}

pub struct RetentionJob {
    buffer: Arc<TickBuffer>,
    keep: Duration,
    metrics: Arc<ServiceMetrics>,
}

impl RetentionJob {
    pub fn new(buffer: Arc<TickBuffer>, keep: Duration, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            buffer,
            keep,
            metrics,
        }
    }

    pub fn run_once(&self, now: i64) -> RetentionSummary {
        let horizon = now.saturating_sub(duration_nanos(self.keep));
        let pruned = self.buffer.prune_older_than(horizon);
        let remaining = self.buffer.len();

        self.metrics.record_retention(pruned as u64);
        if pruned > 0 {
            info!(pruned, remaining, horizon, "Pruned expired ticks");
        } else {
            debug!(remaining, horizon, "Retention run found nothing to prune");
        }

        RetentionSummary {
            horizon,
            pruned,
            remaining,
        }
    }
}
