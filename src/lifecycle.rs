//! Startup, flush, and drain orchestration.
//!
//! The teacher has no equivalent controller — its Python-facing API
//! exposes `complete()`/`shutdown()` as free methods on the global
//! logger (`logger.rs`), with no forced-timeout semantics. This module
//! generalizes that shape into an explicit controller grounded in
//! `abitofhelp-adaptive_pipeline`'s staged startup/shutdown
//! (`pipeline.rs`'s `start`/`stop` pair, sinks closed in reverse start
//! order).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::diagnostics::DiagnosticsChannel;
use crate::metrics::Metrics;
use crate::queue::BoundedQueue;
use crate::worker::{BatchConfig, PipelineStages, SinkGroup, StageBudgets, WorkerPool};

/// Outcome of one drain call.
#[derive(Debug, Clone, Copy)]
pub struct DrainResult {
    pub submitted: u64,
    pub processed: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub retried: u64,
    pub queue_depth_high_water: usize,
    pub flush_latency: Duration,
    /// `true` if the configured timeout elapsed before every worker
    /// observed the shutdown barrier — remaining entries were counted as
    /// dropped rather than awaited indefinitely.
    pub forced: bool,
}

/// Owns the queue, worker pool, and sink lifecycle. Created once per
/// logger instance by `facade::Logger::builder().build()`.
pub struct LifecycleController {
    queue: BoundedQueue,
    stages: Arc<PipelineStages>,
    budgets: Arc<StageBudgets>,
    groups: Arc<Vec<SinkGroup>>,
    workers: usize,
    batch_config: BatchConfig,
    metrics: Arc<Metrics>,
    diagnostics: Arc<DiagnosticsChannel>,
    pool: Mutex<Option<WorkerPool>>,
    shutdown_timeout: Duration,
}

impl LifecycleController {
    /// Starts every sink (in declared order) then spawns the worker pool.
    /// Returns [`crate::error::Error::NoUsableSinks`] if `groups` is empty.
    pub async fn start(
        queue: BoundedQueue,
        stages: Arc<PipelineStages>,
        groups: Arc<Vec<SinkGroup>>,
        workers: usize,
        batch_config: BatchConfig,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
        diagnostics: Arc<DiagnosticsChannel>,
    ) -> crate::error::Result<Self> {
        if groups.is_empty() {
            return Err(crate::error::Error::NoUsableSinks);
        }

        for group in groups.iter() {
            group.primary.sink.start().await?;
            if let Some(fallback) = &group.fallback {
                fallback.sink.start().await?;
            }
        }

        let budgets = Arc::new(StageBudgets::for_stages(&stages));
        let pool = WorkerPool::spawn(
            workers,
            queue.clone(),
            stages.clone(),
            budgets.clone(),
            groups.clone(),
            batch_config,
            metrics.clone(),
            diagnostics.clone(),
        );

        tracing::debug!(workers, sinks = groups.len(), "pipeline started");

        Ok(Self {
            queue,
            stages,
            budgets,
            groups,
            workers,
            batch_config,
            metrics,
            diagnostics,
            pool: Mutex::new(Some(pool)),
            shutdown_timeout,
        })
    }

    pub fn queue(&self) -> &BoundedQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn diagnostics(&self) -> &DiagnosticsChannel {
        &self.diagnostics
    }

    /// Injects a flush barrier and waits for every worker to observe it,
    /// i.e. every envelope submitted before this call has been routed and
    /// every open sink batch has been written. Does not stop anything.
    pub async fn flush(&self) -> Duration {
        let started = Instant::now();
        let handle = self.queue.submit_barrier(false);
        handle.completed().await;
        started.elapsed()
    }

    /// Restarts the worker pool in place: aborts the current workers,
    /// clears every plugin's failure-budget disable flag, and spawns a
    /// fresh pool against the same queue, stage pipeline, and sinks.
    /// The queue and sinks are left running — this is a corrective
    /// action for plugins tripped into `disabled` by [`StageBudgets`],
    /// not a full shutdown/drain.
    pub async fn restart(&self) {
        if let Some(old) = self.pool.lock().await.take() {
            old.abort();
        }
        self.budgets.reset_all();
        let pool = WorkerPool::spawn(
            self.workers,
            self.queue.clone(),
            self.stages.clone(),
            self.budgets.clone(),
            self.groups.clone(),
            self.batch_config,
            self.metrics.clone(),
            self.diagnostics.clone(),
        );
        *self.pool.lock().await = Some(pool);
        tracing::info!("worker pool restarted; plugin failure budgets reset");
    }

    /// Drains the pipeline: closes the queue to new submissions, injects
    /// a shutdown barrier, waits up to `timeout` (falling back to the
    /// controller's configured default) for every worker to exit, stops
    /// every sink in reverse start order, and reports the final counters.
    pub async fn drain(&self, timeout: Option<Duration>) -> DrainResult {
        let timeout = timeout.unwrap_or(self.shutdown_timeout);
        let started = Instant::now();

        self.queue.close();
        let handle = self.queue.submit_barrier(true);

        let forced = match tokio::time::timeout(timeout, handle.completed()).await {
            Ok(()) => false,
            Err(_) => {
                let remaining = self.queue.len() as u64;
                self.diagnostics.report(
                    "lifecycle:drain",
                    format!("shutdown timed out after {timeout:?} with {remaining} entries still queued"),
                );
                eprintln!("[fapilog] shutdown timed out; {remaining} entries dropped");
                true
            }
        };

        if let Some(pool) = self.pool.lock().await.take() {
            pool.join().await;
        }

        for group in self.groups.iter().rev() {
            if let Some(fallback) = &group.fallback {
                if let Err(e) = fallback.sink.stop().await {
                    self.diagnostics.report(&format!("sink:{}", fallback.sink.name()), e.to_string());
                }
            }
            if let Err(e) = group.primary.sink.stop().await {
                self.diagnostics.report(&format!("sink:{}", group.primary.sink.name()), e.to_string());
            }
        }

        let snapshot = self.metrics.snapshot();
        DrainResult {
            submitted: snapshot.submitted.max(self.queue.submitted()),
            processed: snapshot.processed,
            dropped: snapshot.dropped.max(self.queue.dropped()),
            filtered: snapshot.filtered,
            retried: snapshot.retried,
            queue_depth_high_water: snapshot.queue_depth_high_water.max(self.queue.depth_high_water()),
            flush_latency: started.elapsed(),
            forced,
        }
    }

    /// Waits for SIGINT (and, on Unix, SIGTERM) then drains with the
    /// controller's configured timeout. Intended to be spawned as its own
    /// task by the application's main function.
    pub async fn run_until_signal(self: Arc<Self>) -> DrainResult {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        self.drain(None).await
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
