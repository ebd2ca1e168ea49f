//! Background consumers draining the queue.
//!
//! Grounded in an async writer thread pattern (`backend/async.rs`): same
//! buffer-then-flush shape (accumulate until a size/count/time threshold,
//! then write), generalized from one file destination to N sink routes
//! and from a flat string buffer to a full stage pipeline plus per-sink
//! batching.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tokio::task::JoinHandle;

use crate::diagnostics::DiagnosticsChannel;
use crate::envelope::Envelope;
use crate::metrics::Metrics;
use crate::pipeline::{isolated, Enricher, Filter, FailureBudget, RedactOutcome, Redactor, Serializer};
use crate::queue::{BoundedQueue, QueueEntry};
use crate::sink::{Sink, SinkRecord, SinkRoute};

/// The ordered set of stage plugins every envelope runs through.
pub struct PipelineStages {
    pub enrichers: Vec<Arc<dyn Enricher>>,
    pub redactors: Vec<Arc<dyn Redactor>>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub serializer: Arc<dyn Serializer>,
}

/// A primary sink plus its optional fallback, routed as a unit.
pub struct SinkGroup {
    pub primary: SinkRoute,
    pub fallback: Option<SinkRoute>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_count: usize,
    pub max_bytes: usize,
    pub batch_timeout: Duration,
    pub pull_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: 200,
            max_bytes: 1 << 20,
            batch_timeout: Duration::from_millis(500),
            pull_size: 256,
        }
    }
}

/// Per-plugin failure budgets, keyed by plugin name, shared read-only
/// across all workers in the pool.
pub struct StageBudgets {
    budgets: AHashMap<String, FailureBudget>,
}

impl StageBudgets {
    pub fn for_stages(stages: &PipelineStages) -> Self {
        let mut budgets = AHashMap::new();
        for e in &stages.enrichers {
            budgets.insert(e.name().to_string(), FailureBudget::default());
        }
        for r in &stages.redactors {
            budgets.insert(r.name().to_string(), FailureBudget::default());
        }
        for f in &stages.filters {
            budgets.insert(f.name().to_string(), FailureBudget::default());
        }
        Self { budgets }
    }

    fn is_disabled(&self, name: &str) -> bool {
        self.budgets.get(name).is_some_and(FailureBudget::is_disabled)
    }

    fn record_failure(&self, name: &str) {
        if let Some(b) = self.budgets.get(name) {
            b.record_failure();
        }
    }

    /// Clears every plugin's disabled flag; called on lifecycle restart.
    pub fn reset_all(&self) {
        for budget in self.budgets.values() {
            budget.reset();
        }
    }
}

struct Batch {
    records: Vec<(Envelope, Vec<u8>)>,
    bytes: usize,
    started: Instant,
}

impl Batch {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            bytes: 0,
            started: Instant::now(),
        }
    }

    fn push(&mut self, envelope: Envelope, bytes: Vec<u8>) {
        self.bytes += bytes.len();
        self.records.push((envelope, bytes));
    }

    fn should_flush(&self, cfg: &BatchConfig) -> bool {
        !self.records.is_empty()
            && (self.records.len() >= cfg.max_count
                || self.bytes >= cfg.max_bytes
                || self.started.elapsed() >= cfg.batch_timeout)
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn take(&mut self) -> Batch {
        std::mem::replace(self, Batch::new())
    }
}

/// Runs one stage pipeline pass over `envelope`. Returns the serialized
/// bytes, or `None` if a filter/redactor dropped the envelope.
async fn process_envelope(
    stages: &PipelineStages,
    envelope: &mut Envelope,
    budgets: &StageBudgets,
    diagnostics: &DiagnosticsChannel,
) -> Option<Vec<u8>> {
    for enricher in &stages.enrichers {
        if budgets.is_disabled(enricher.name()) {
            continue;
        }
        if let Err(msg) = isolated(enricher.enrich(envelope)).await {
            diagnostics.report(&format!("enricher:{}", enricher.name()), msg);
            budgets.record_failure(enricher.name());
        }
    }

    for redactor in &stages.redactors {
        if budgets.is_disabled(redactor.name()) {
            continue;
        }
        match isolated(redactor.redact(envelope)).await {
            Ok(RedactOutcome::Continue) => {}
            Ok(RedactOutcome::DropEnvelope) => return None,
            Err(msg) => {
                diagnostics.report(&format!("redactor:{}", redactor.name()), msg);
                budgets.record_failure(redactor.name());
            }
        }
    }

    for filter in &stages.filters {
        if budgets.is_disabled(filter.name()) {
            continue;
        }
        match isolated(filter.filter(envelope)).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(msg) => {
                diagnostics.report(&format!("filter:{}", filter.name()), msg);
                budgets.record_failure(filter.name());
            }
        }
    }

    Some(stages.serializer.serialize(envelope))
}

/// Picks which concrete sink (primary or fallback) should receive this
/// envelope within a group, per the circuit-breaker routing rule:
/// fallback only receives traffic while the primary's breaker is open.
fn select_target<'a>(group: &'a SinkGroup) -> Option<(&'a SinkRoute, bool)> {
    use crate::sink::Health;
    match group.primary.breaker.health() {
        Health::Healthy | Health::Degraded => Some((&group.primary, true)),
        Health::Open => group.fallback.as_ref().map(|f| (f, false)),
    }
}

async fn write_batch_to(route: &SinkRoute, batch: Batch, metrics: &Metrics, diagnostics: &DiagnosticsChannel) {
    if batch.is_empty() {
        return;
    }
    let count = batch.records.len() as u64;

    if matches!(route.breaker.health(), crate::sink::Health::Degraded) && !route.breaker.try_claim_probe() {
        // Another write already claimed the single half-open probe slot;
        // treat this batch as dropped rather than pile onto a sink that
        // hasn't proven itself recovered yet.
        diagnostics.report(&format!("sink:{}", route.sink.name()), "half-open probe already in flight");
        metrics.dropped.fetch_add(count, Ordering::Relaxed);
        return;
    }

    let records: Vec<SinkRecord> = batch
        .records
        .iter()
        .map(|(e, b)| SinkRecord { envelope: e, serialized: b })
        .collect();

    match route.sink.write_batch(&records).await {
        Ok(()) => {
            route.breaker.record_success();
            metrics.processed.fetch_add(count, Ordering::Relaxed);
            metrics.bytes_written.fetch_add(batch.bytes as u64, Ordering::Relaxed);
        }
        Err(e) => {
            route.breaker.record_failure();
            diagnostics.report(&format!("sink:{}", route.sink.name()), e.to_string());
            metrics.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }
}

async fn flush_group(group: &SinkGroup, primary_batch: Batch, fallback_batch: Batch, metrics: &Metrics, diagnostics: &DiagnosticsChannel) {
    write_batch_to(&group.primary, primary_batch, metrics, diagnostics).await;
    if let Some(fallback) = &group.fallback {
        write_batch_to(fallback, fallback_batch, metrics, diagnostics).await;
    }
}

async fn flush_all(groups: &[SinkGroup], batches: &mut [(Batch, Batch)], metrics: &Metrics, diagnostics: &DiagnosticsChannel) {
    for (group, (primary, fallback)) in groups.iter().zip(batches.iter_mut()) {
        flush_group(group, primary.take(), fallback.take(), metrics, diagnostics).await;
    }
}

async fn worker_loop(
    id: usize,
    queue: BoundedQueue,
    stages: Arc<PipelineStages>,
    budgets: Arc<StageBudgets>,
    groups: Arc<Vec<SinkGroup>>,
    batch_config: BatchConfig,
    metrics: Arc<Metrics>,
    diagnostics: Arc<DiagnosticsChannel>,
) {
    let mut sequence: u64 = 0;
    let mut batches: Vec<(Batch, Batch)> = groups.iter().map(|_| (Batch::new(), Batch::new())).collect();
    let mut ticker = tokio::time::interval(batch_config.batch_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::debug!(worker = id, "worker starting");

    loop {
        tokio::select! {
            entries = queue.pop_batch(batch_config.pull_size) => {
                if entries.is_empty() {
                    if queue.is_closed() {
                        flush_all(&groups, &mut batches, &metrics, &diagnostics).await;
                        break;
                    }
                    continue;
                }

                metrics.record_queue_depth_high_water(queue.depth_high_water());

                let mut shutting_down = false;
                for entry in entries {
                    match entry {
                        QueueEntry::Envelope(mut envelope) => {
                            sequence += 1;
                            envelope.sequence = sequence;
                            match process_envelope(&stages, &mut envelope, &budgets, &diagnostics).await {
                                Some(serialized) => {
                                    let mut routed = false;
                                    for (group, (primary_batch, fallback_batch)) in groups.iter().zip(batches.iter_mut()) {
                                        if !group.primary.accepts(&envelope) {
                                            continue;
                                        }
                                        routed = true;
                                        if let Some((_, is_primary)) = select_target(group) {
                                            if is_primary {
                                                primary_batch.push(envelope.clone(), serialized.clone());
                                            } else {
                                                fallback_batch.push(envelope.clone(), serialized.clone());
                                            }
                                        } else {
                                            diagnostics.report("worker:routing", "primary open and no fallback configured");
                                        }
                                    }
                                    if !routed {
                                        diagnostics.report("worker:routing", "no sink route accepted this envelope");
                                    }
                                }
                                None => {
                                    metrics.filtered.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        QueueEntry::FlushBarrier(ack) => {
                            flush_all(&groups, &mut batches, &metrics, &diagnostics).await;
                            ack.signal();
                        }
                        QueueEntry::ShutdownBarrier(ack) => {
                            flush_all(&groups, &mut batches, &metrics, &diagnostics).await;
                            ack.signal();
                            shutting_down = true;
                        }
                    }
                }

                for (group, (primary_batch, fallback_batch)) in groups.iter().zip(batches.iter_mut()) {
                    if primary_batch.should_flush(&batch_config) {
                        write_batch_to(&group.primary, primary_batch.take(), &metrics, &diagnostics).await;
                    }
                    if let Some(fallback) = &group.fallback {
                        if fallback_batch.should_flush(&batch_config) {
                            write_batch_to(fallback, fallback_batch.take(), &metrics, &diagnostics).await;
                        }
                    }
                }

                if shutting_down {
                    break;
                }
            }
            _ = ticker.tick() => {
                flush_all(&groups, &mut batches, &metrics, &diagnostics).await;
            }
        }
    }

    tracing::debug!(worker = id, "worker stopped");
}

/// Spawns `count` background workers draining `queue` against a shared
/// stage pipeline and sink topology.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `budgets` is supplied by the caller (rather than built internally)
    /// so a lifecycle restart can hand the same, just-reset
    /// [`StageBudgets`] to the freshly spawned pool instead of starting
    /// every plugin with an implicit, unreachable budget.
    pub fn spawn(
        count: usize,
        queue: BoundedQueue,
        stages: Arc<PipelineStages>,
        budgets: Arc<StageBudgets>,
        groups: Arc<Vec<SinkGroup>>,
        batch_config: BatchConfig,
        metrics: Arc<Metrics>,
        diagnostics: Arc<DiagnosticsChannel>,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|id| {
                let queue = queue.clone();
                let stages = stages.clone();
                let budgets = budgets.clone();
                let groups = groups.clone();
                let metrics = metrics.clone();
                let diagnostics = diagnostics.clone();
                tokio::spawn(worker_loop(id, queue, stages, budgets, groups, batch_config, metrics, diagnostics))
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker task to exit (after observing a shutdown barrier).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Aborts every worker task immediately, without waiting for it to
    /// observe a shutdown barrier. Used when restarting the pool in
    /// place; in-flight batches on aborted workers are lost, which is
    /// why a restart is a deliberate corrective action, not something
    /// triggered on the steady-state path.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;
    use crate::pipeline::serialize::JsonLinesSerializer;
    use crate::queue::BackpressurePolicy;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn start(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn write(&self, _record: SinkRecord<'_>) -> std::io::Result<()> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn write_batch(&self, records: &[SinkRecord<'_>]) -> std::io::Result<()> {
            self.count.fetch_add(records.len(), Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    fn stages() -> Arc<PipelineStages> {
        Arc::new(PipelineStages {
            enrichers: vec![],
            redactors: vec![],
            filters: vec![],
            serializer: Arc::new(JsonLinesSerializer),
        })
    }

    #[tokio::test]
    async fn worker_drains_queue_and_writes_to_sink() {
        let queue = BoundedQueue::new(100, BackpressurePolicy::DropNewest);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CountingSink { count: count.clone() });
        let groups = Arc::new(vec![SinkGroup {
            primary: SinkRoute::primary(sink),
            fallback: None,
        }]);
        let metrics = Arc::new(Metrics::new());
        let diagnostics = Arc::new(DiagnosticsChannel::new());
        let batch_config = BatchConfig {
            max_count: 1,
            ..Default::default()
        };

        let built_stages = stages();
        let budgets = Arc::new(StageBudgets::for_stages(&built_stages));
        let pool = WorkerPool::spawn(1, queue.clone(), built_stages, budgets, groups, batch_config, metrics.clone(), diagnostics);

        for _ in 0..5 {
            queue.submit(Envelope::new(Level::INFO, "INFO", "hi")).await;
        }
        let handle = queue.submit_barrier(true);
        handle.completed().await;
        pool.join().await;

        assert_eq!(count.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.snapshot().filtered, 0);
    }

    #[tokio::test]
    async fn worker_counts_filtered_envelopes() {
        use crate::pipeline::filter::LevelThresholdFilter;

        let queue = BoundedQueue::new(100, BackpressurePolicy::DropNewest);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CountingSink { count: count.clone() });
        let groups = Arc::new(vec![SinkGroup {
            primary: SinkRoute::primary(sink),
            fallback: None,
        }]);
        let stages = Arc::new(PipelineStages {
            enrichers: vec![],
            redactors: vec![],
            filters: vec![Arc::new(LevelThresholdFilter::new(Level::ERROR))],
            serializer: Arc::new(JsonLinesSerializer),
        });
        let metrics = Arc::new(Metrics::new());
        let diagnostics = Arc::new(DiagnosticsChannel::new());

        let budgets = Arc::new(StageBudgets::for_stages(&stages));
        let pool = WorkerPool::spawn(1, queue.clone(), stages, budgets, groups, BatchConfig::default(), metrics.clone(), diagnostics);

        queue.submit(Envelope::new(Level::INFO, "INFO", "below floor")).await;
        queue.submit(Envelope::new(Level::CRITICAL, "CRITICAL", "above floor")).await;
        let handle = queue.submit_barrier(true);
        handle.completed().await;
        pool.join().await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.snapshot().filtered, 1);
    }
}
