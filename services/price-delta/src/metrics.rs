//! Observability and metrics for the price-delta service
//!
//! Counters for ingestion, retention and delta computation, plus a rolling
//! window of delta run durations. Exported as a flat map for logging or
//! scraping.
//!
//! [`AlertMonitor`] compares successive snapshots and raises alerts when a
//! counter grew by more than its threshold between two checks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, warn};

use crate::config::EngineConfig;

/// Delta runs remembered when no cadence is given.
const DEFAULT_RUN_WINDOW: usize = 120;

/// Core metrics for the price-delta service.
pub struct ServiceMetrics {
    // Ingestion
    pub ticks_ingested: AtomicU64,
    pub ticks_malformed: AtomicU64,

    // Retention
    pub retention_runs: AtomicU64,
    pub ticks_pruned: AtomicU64,

    // Delta computation
    pub delta_runs: AtomicU64,
    pub ticks_scanned: AtomicU64,
    pub deltas_emitted: AtomicU64,
    pub deltas_unmatched: AtomicU64,
    pub sink_failures: AtomicU64,
    delta_run_ns: Mutex<RunTimings>,

    // Scheduling
    pub job_panics: AtomicU64,

    // Publishing
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::with_run_window(DEFAULT_RUN_WINDOW)
    }

    /// Metrics keeping the durations of one retention horizon's worth of delta runs.
    pub fn for_engine(config: &EngineConfig) -> Self {
        let runs = config.keep.as_nanos() / config.calc_interval.as_nanos().max(1);
        Self::with_run_window(usize::try_from(runs).unwrap_or(usize::MAX).max(1))
    }

    fn with_run_window(runs: usize) -> Self {
        Self {
            ticks_ingested: AtomicU64::new(0),
            ticks_malformed: AtomicU64::new(0),
            retention_runs: AtomicU64::new(0),
            ticks_pruned: AtomicU64::new(0),
            delta_runs: AtomicU64::new(0),
            ticks_scanned: AtomicU64::new(0),
            deltas_emitted: AtomicU64::new(0),
            deltas_unmatched: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            delta_run_ns: Mutex::new(RunTimings::new(runs)),
            job_panics: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    /// Record a tick accepted into the buffer.
    pub fn record_tick_ingested(&self) {
        self.ticks_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped as malformed.
    pub fn record_tick_malformed(&self) {
        self.ticks_malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed retention run.
    pub fn record_retention(&self, pruned: u64) {
        self.retention_runs.fetch_add(1, Ordering::Relaxed);
        self.ticks_pruned.fetch_add(pruned, Ordering::Relaxed);
    }

    /// Record a completed delta run.
    pub fn record_delta_run(
        &self,
        scanned: u64,
        emitted: u64,
        unmatched: u64,
        sink_failures: u64,
        duration_ns: u64,
    ) {
        self.delta_runs.fetch_add(1, Ordering::Relaxed);
        self.ticks_scanned.fetch_add(scanned, Ordering::Relaxed);
        self.deltas_emitted.fetch_add(emitted, Ordering::Relaxed);
        self.deltas_unmatched.fetch_add(unmatched, Ordering::Relaxed);
        self.sink_failures.fetch_add(sink_failures, Ordering::Relaxed);
        self.timings().record(duration_ns);
    }

    /// Record a job run that panicked.
    pub fn record_job_panic(&self) {
        self.job_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message handed to the broker.
    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a ticker skipped after exhausting its retries.
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// p99 of the remembered delta run durations.
    pub fn delta_run_p99_ns(&self) -> Option<u64> {
        self.timings().percentile(99)
    }

    /// Export counters as a flat map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks_ingested".to_string(), self.ticks_ingested.load(Ordering::Relaxed));
        m.insert("ticks_malformed".to_string(), self.ticks_malformed.load(Ordering::Relaxed));
        m.insert("retention_runs".to_string(), self.retention_runs.load(Ordering::Relaxed));
        m.insert("ticks_pruned".to_string(), self.ticks_pruned.load(Ordering::Relaxed));
        m.insert("delta_runs".to_string(), self.delta_runs.load(Ordering::Relaxed));
        m.insert("ticks_scanned".to_string(), self.ticks_scanned.load(Ordering::Relaxed));
        m.insert("deltas_emitted".to_string(), self.deltas_emitted.load(Ordering::Relaxed));
        m.insert("deltas_unmatched".to_string(), self.deltas_unmatched.load(Ordering::Relaxed));
        m.insert("sink_failures".to_string(), self.sink_failures.load(Ordering::Relaxed));
        m.insert("job_panics".to_string(), self.job_panics.load(Ordering::Relaxed));
        m.insert("messages_published".to_string(), self.messages_published.load(Ordering::Relaxed));
        m.insert("publish_failures".to_string(), self.publish_failures.load(Ordering::Relaxed));
        if let Some(p99) = self.delta_run_p99_ns() {
            m.insert("delta_run_p99_ns".to_string(), p99);
        }
        m
    }

    fn timings(&self) -> MutexGuard<'_, RunTimings> {
        self.delta_run_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Durations of the most recent runs, oldest first.
struct RunTimings {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl RunTimings {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, value: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile (0-100) over the window.
    fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (p.min(100) * (sorted.len() - 1) + 50) / 100;
        Some(sorted[idx])
    }
}

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// An alert triggered by a threshold breach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: &'static str,
    pub message: String,
}

impl Alert {
    pub fn log(&self) {
        match self.level {
            AlertLevel::Warning => warn!(metric = self.metric, "{}", self.message),
            AlertLevel::Critical => error!(metric = self.metric, "{}", self.message),
        }
    }
}

/// Growth allowed between two checks before an alert fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertThresholds {
    pub max_ticks_malformed: u64,
    pub max_sink_failures: u64,
    pub max_publish_failures: u64,
    /// Delta run p99 above this means runs no longer fit their interval.
    pub max_delta_run_p99: Duration,
}

impl AlertThresholds {
    /// Thresholds for a service running `config`.
    pub fn for_engine(config: &EngineConfig) -> Self {
        Self {
            max_delta_run_p99: config.calc_interval,
            ..Self::default()
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_ticks_malformed: 100,
            max_sink_failures: 0,
            max_publish_failures: 24,
            max_delta_run_p99: Duration::from_secs(5),
        }
    }
}

/// Raises alerts on counters that grew too fast since the previous check.
#[derive(Debug, Clone)]
pub struct AlertMonitor {
    thresholds: AlertThresholds,
    last: BTreeMap<String, u64>,
}

impl AlertMonitor {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            last: BTreeMap::new(),
        }
    }

    /// Compare `metrics` against the previous check and return new alerts.
    pub fn check(&mut self, metrics: &ServiceMetrics) -> Vec<Alert> {
        let current = metrics.export();
        let grown = |name: &str| {
            let now = current.get(name).copied().unwrap_or(0);
            now.saturating_sub(self.last.get(name).copied().unwrap_or(0))
        };

        let mut alerts = Vec::new();
        let mut over = |metric: &'static str, level: AlertLevel, limit: u64| {
            let n = grown(metric);
            if n > limit {
                alerts.push(Alert {
                    level,
                    metric,
                    message: format!("{} grew by {} since last check (threshold {})", metric, n, limit),
                });
            }
        };
        over("ticks_malformed", AlertLevel::Warning, self.thresholds.max_ticks_malformed);
        over("publish_failures", AlertLevel::Warning, self.thresholds.max_publish_failures);
        over("sink_failures", AlertLevel::Critical, self.thresholds.max_sink_failures);
        over("job_panics", AlertLevel::Critical, 0);

        let limit = self.thresholds.max_delta_run_p99.as_nanos();
        if let Some(p99) = metrics.delta_run_p99_ns() {
            if u128::from(p99) > limit {
                alerts.push(Alert {
                    level: AlertLevel::Warning,
                    metric: "delta_run_p99_ns",
                    message: format!("Delta run p99 {}ns exceeds {}ns", p99, limit),
                });
            }
        }

        self.last = current;
        alerts
    }
}
