//! Service runtime
//!
//! Spawns one task per job on the tokio runtime:
//!
//! ```text
//!   broker (mpsc) ──▶ ingestion relay ──▶ TickBuffer ◀── retention loop (clean_interval)
//!                                             │
//!                                             └──────── delta loop (calc_interval) ──▶ DeltaSink
//! ```
//!
//! Each periodic job runs on its own `tokio::time::interval`. A panic inside
//! a run is caught, logged and counted; the loop carries on at the next tick.
//! An alert monitor checks the metrics on the retention cadence.
//! Shutdown is a `watch` signal: loops finish their current run and exit, and
//! the delta sink is flushed on the way out.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::buffer::TickBuffer;
use crate::clock::Clock;
use crate::config::{ConfigError, ServiceConfig};
use crate::delta::DeltaJob;
use crate::ingestion::Ingester;
use crate::metrics::{AlertMonitor, AlertThresholds, ServiceMetrics};
use crate::retention::RetentionJob;
use crate::sink::DeltaSink;

/// Run `job` every `period` until shutdown is signalled.
///
/// The first run happens one full period after start.
pub async fn run_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<ServiceMetrics>,
    mut job: F,
) where
    F: FnMut(),
{
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval() fires immediately; swallow that tick
    timer.tick().await;

    info!(job = name, period_ms = period.as_millis() as u64, "Job started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = timer.tick() => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(&mut job)) {
                    metrics.record_job_panic();
                    error!(
                        job = name,
                        panic = %panic_message(panic.as_ref()),
                        "Job run panicked, continuing at next interval"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(job = name, "Job stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a running service.
pub struct ServiceHandle {
    buffer: Arc<TickBuffer>,
    metrics: Arc<ServiceMetrics>,
    broker: mpsc::Sender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceHandle {
    /// Sender side of the broker channel, for publishers.
    pub fn broker(&self) -> mpsc::Sender<Vec<u8>> {
        self.broker.clone()
    }

    /// Shutdown signal for tasks spawned outside the service.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn buffer(&self) -> Arc<TickBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Signal every job to stop and wait for all of them.
    pub async fn shutdown(self) {
        info!("Shutting down service");
        // Stored even if every receiver is already gone
        self.shutdown_tx.send_replace(true);
        drop(self.broker);

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }

        info!(metrics = ?self.metrics.export(), "Service stopped");
    }
}

/// Start the ingestion relay, retention job and delta job.
///
/// Must be called from within a tokio runtime.
pub fn spawn(
    config: ServiceConfig,
    sink: Box<dyn DeltaSink>,
    clock: Arc<dyn Clock>,
) -> Result<ServiceHandle, ConfigError> {
    config.validate()?;

    let buffer = Arc::new(TickBuffer::new());
    let metrics = Arc::new(ServiceMetrics::for_engine(&config.engine));
    let (shutdown_tx, _) = watch::channel(false);
    let (broker, inbox) = mpsc::channel(config.channel_capacity);
    let mut tasks = Vec::with_capacity(4);

    let ingester = Ingester::new(Arc::clone(&buffer), Arc::clone(&clock), Arc::clone(&metrics));
    tasks.push((
        "ingestion",
        tokio::spawn(ingester.run(inbox, shutdown_tx.subscribe())),
    ));

    let retention = RetentionJob::new(Arc::clone(&buffer), config.engine.keep, Arc::clone(&metrics));
    {
        let clock = Arc::clone(&clock);
        let shutdown = shutdown_tx.subscribe();
        let metrics = Arc::clone(&metrics);
        let period = config.engine.clean_interval;
        tasks.push((
            "retention",
            tokio::spawn(async move {
                run_periodic("retention", period, shutdown, metrics, || {
                    retention.run_once(clock.now());
                })
                .await;
            }),
        ));
    }

    let mut delta = DeltaJob::new(
        Arc::clone(&buffer),
        config.engine.clone(),
        sink,
        Arc::clone(&metrics),
        clock.now(),
    );
    {
        let shutdown = shutdown_tx.subscribe();
        let metrics = Arc::clone(&metrics);
        let period = config.engine.calc_interval;
        tasks.push((
            "delta",
            tokio::spawn(async move {
                run_periodic("delta", period, shutdown, metrics, || {
                    delta.run(clock.as_ref());
                })
                .await;
                delta.finish();
            }),
        ));
    }

    let mut monitor = AlertMonitor::new(AlertThresholds::for_engine(&config.engine));
    {
        let shutdown = shutdown_tx.subscribe();
        let period = config.engine.clean_interval;
        let job_metrics = Arc::clone(&metrics);
        let watched = Arc::clone(&metrics);
        tasks.push((
            "alerts",
            tokio::spawn(async move {
                run_periodic("alerts", period, shutdown, job_metrics, || {
                    for alert in monitor.check(&watched) {
                        alert.log();
                    }
                })
                .await;
            }),
        ));
    }

    info!(
        target_lag_secs = config.engine.target_lag.as_secs_f64(),
        tolerance_secs = config.engine.tolerance.as_secs_f64(),
        keep_secs = config.engine.keep.as_secs_f64(),
        calc_interval_secs = config.engine.calc_interval.as_secs_f64(),
        clean_interval_secs = config.engine.clean_interval.as_secs_f64(),
        "Service started"
    );

    Ok(ServiceHandle {
        buffer,
        metrics,
        broker,
        shutdown_tx,
        tasks,
    })
}
