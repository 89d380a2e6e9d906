//! Delta computation job
//!
//! Each run scans the ticks ingested since the previous run and pairs every
//! one of them with a historical reference tick of the same instrument,
//! published roughly `target_lag` earlier.
//!
//! Run flow:
//! 1. Pin one buffer view, then read and seal `now` under it
//! 2. Collect ticks with `ingest_time` in `(last_run_time, now]`
//! 3. For each tick, search `[t - (lag + tol), t - (lag - tol)]` by publish time
//!    and keep the candidate closest to `t - lag` (first inserted wins ties)
//! 4. Release the view and advance the watermark to `now`
//! 5. Write the records to the sink, flush
//!
//! The watermark moves before any sink call, so a write that fails or panics
//! loses its records instead of re-emitting the batch on the next run.
//! Unmatched ticks produce nothing and are never retried.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};
use types::delta::DeltaRecord;
use types::tick::Tick;

use crate::buffer::{BufferView, TickBuffer};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::metrics::ServiceMetrics;
use crate::sink::DeltaSink;

/// Pick the candidate whose publish time is closest to `target`.
///
/// Ties go to the earliest candidate in iteration order.
pub fn select_reference<'a, I>(candidates: I, target: i64) -> Option<&'a Tick>
where
    I: IntoIterator<Item = &'a Tick>,
{
    let mut best: Option<(&Tick, u64)> = None;
    for candidate in candidates {
        let distance = candidate.distance_to(target);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((candidate, distance)),
        }
    }
    best.map(|(tick, _)| tick)
}

/// Records computed by one scan, before they reach the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    pub records: Vec<DeltaRecord>,
    pub scanned: usize,
    pub unmatched: usize,
}

/// Outcome of one delta run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Watermark the run scanned from (exclusive).
    pub since: i64,
    /// Time the run scanned up to (inclusive).
    pub upto: i64,
    pub scanned: usize,
    pub emitted: usize,
    pub unmatched: usize,
    pub sink_failures: usize,
}

/// Periodic delta computation over the shared buffer.
pub struct DeltaJob {
    buffer: Arc<TickBuffer>,
    config: EngineConfig,
    sink: Box<dyn DeltaSink>,
    metrics: Arc<ServiceMetrics>,
    /// Ingest-time watermark: ticks at or before it have been scanned.
    last_run_time: i64,
}

impl DeltaJob {
    /// Create a job whose first run scans ticks ingested after `watermark`.
    pub fn new(
        buffer: Arc<TickBuffer>,
        config: EngineConfig,
        sink: Box<dyn DeltaSink>,
        metrics: Arc<ServiceMetrics>,
        watermark: i64,
    ) -> Self {
        info!(
            target_lag_secs = config.target_lag.as_secs_f64(),
            tolerance_secs = config.tolerance.as_secs_f64(),
            sink = sink.backend_type(),
            watermark,
            "DeltaJob initialized"
        );

        // Ticks stamped from here on land after the first scan's lower bound
        buffer.seal(watermark);

        Self {
            buffer,
            config,
            sink,
            metrics,
            last_run_time: watermark,
        }
    }

    pub fn last_run_time(&self) -> i64 {
        self.last_run_time
    }

    /// Compute the records for ticks ingested in `(last_run_time, now]`.
    ///
    /// Reads one consistent view of the buffer, seals `now` into it and does
    /// not touch the sink or the watermark.
    pub fn compute(&self, now: i64) -> DeltaBatch {
        let view = self.buffer.view();
        view.seal(now);
        self.scan(&view, now)
    }

    fn scan(&self, view: &BufferView<'_>, now: i64) -> DeltaBatch {
        let new_ticks = view.query_ingested_since(self.last_run_time, now);

        let mut batch = DeltaBatch {
            records: Vec::with_capacity(new_ticks.len()),
            scanned: new_ticks.len(),
            unmatched: 0,
        };

        for tick in &new_ticks {
            let (lo, hi) = self.config.search_bounds(tick.publish_time);
            let target = self.config.reference_target(tick.publish_time);

            match select_reference(view.range(&tick.instrument, lo, hi), target) {
                Some(reference) => batch.records.push(DeltaRecord::from_match(tick, reference)),
                None => {
                    batch.unmatched += 1;
                    debug!(
                        instrument = %tick.instrument,
                        publish_time = tick.publish_time,
                        "No reference tick in window"
                    );
                }
            }
        }

        batch
    }

    /// Run one scan, reading `now` from `clock` while the view is held.
    pub fn run(&mut self, clock: &dyn Clock) -> RunSummary {
        let started = Instant::now();
        let (now, batch) = {
            let view = self.buffer.view();
            let now = view.seal_now(clock);
            (now, self.scan(&view, now))
        };
        self.commit(now, batch, started)
    }

    /// Run one scan at `now`, advance the watermark and write its records.
    pub fn run_once(&mut self, now: i64) -> RunSummary {
        let started = Instant::now();
        let batch = self.compute(now);
        self.commit(now, batch, started)
    }

    fn commit(&mut self, now: i64, batch: DeltaBatch, started: Instant) -> RunSummary {
        let since = self.last_run_time;
        // Never move backwards, even if the clock does.
        self.last_run_time = since.max(now);

        let mut sink_failures = 0;
        for record in &batch.records {
            if let Err(e) = self.sink.write(record) {
                sink_failures += 1;
                error!(
                    instrument = %record.instrument,
                    publish_time = record.publish_time,
                    error = %e,
                    "Failed to write delta record"
                );
            }
        }
        if !batch.records.is_empty() {
            if let Err(e) = self.sink.flush() {
                sink_failures += 1;
                error!(error = %e, "Failed to flush sink");
            }
        }

        let summary = RunSummary {
            since,
            upto: now,
            scanned: batch.scanned,
            emitted: batch.records.len() - sink_failures.min(batch.records.len()),
            unmatched: batch.unmatched,
            sink_failures,
        };

        let elapsed_ns = started.elapsed().as_nanos() as u64;
        self.metrics.record_delta_run(
            summary.scanned as u64,
            summary.emitted as u64,
            summary.unmatched as u64,
            summary.sink_failures as u64,
            elapsed_ns,
        );

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                emitted = summary.emitted,
                unmatched = summary.unmatched,
                sink_failures = summary.sink_failures,
                elapsed_us = elapsed_ns / 1_000,
                "Delta run complete"
            );
        } else {
            debug!(since, upto = now, "Delta run found no new ticks");
        }

        summary
    }

    /// Flush the sink before the job is dropped.
    pub fn finish(&mut self) {
        match self.sink.flush() {
            Ok(()) => info!(sink = self.sink.backend_type(), "Delta sink flushed"),
            Err(e) => error!(error = %e, "Failed to flush sink on shutdown"),
        }
    }
}
