//! Producer-facing handle.
//!
//! Generalizes the global-logger-with-closures shape (a mutable state
//! struct guarded by a lock, reached through `with_state`) into a cheap,
//! `Arc`-backed, non-global `Logger`, with an optional process-wide
//! default installed through `once_cell::sync::OnceCell`.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;

use crate::context::ContextStore;
use crate::diagnostics::DiagnosticsChannel;
use crate::envelope::{Envelope, Level, Value};
use crate::lifecycle::{DrainResult, LifecycleController};
use crate::metrics::{Metrics, Snapshot};
use crate::pipeline::filter::TraceConsistentSamplingFilter;
use crate::pipeline::serialize::{JsonLinesSerializer, PrettySerializer};
use crate::pipeline::{Enricher, Filter, Redactor, Serializer};
use crate::queue::BoundedQueue;
use crate::sink::{SinkRoute};
use crate::worker::{BatchConfig, PipelineStages, SinkGroup};
use crate::config::{Format, Settings};

struct Inner {
    lifecycle: Arc<LifecycleController>,
    /// Shared with the filter stage when configured, so the facade can
    /// bypass `sample_on_pressure`'s coin flip for a trace id this filter
    /// has already admitted.
    trace_consistent_filter: Option<Arc<TraceConsistentSamplingFilter>>,
}

/// A cheap, cloneable handle producers log through.
///
/// `bound` is this facade's own local context map — distinct from the
/// task-scoped [`ContextStore`] ambient context. It is immutable once
/// set: [`Logger::bind`]/[`Logger::unbind`] return a new `Logger`
/// carrying an extended or shrunk map rather than mutating `self` or
/// any shared state.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
    floor: Level,
    bound: Arc<IndexMap<String, Value>>,
}

impl Logger {
    pub fn builder() -> LoggerBuilder {
        LoggerBuilder::new()
    }

    /// Returns a handle sharing this logger's pipeline but with a
    /// different severity floor — cheap, since only the floor changes.
    pub fn with_level(&self, floor: Level) -> Logger {
        Logger {
            inner: self.inner.clone(),
            floor,
            bound: self.bound.clone(),
        }
    }

    pub fn level(&self) -> Level {
        self.floor
    }

    /// Returns a new facade sharing this logger's pipeline but carrying
    /// an additional local context map; does not mutate `self` or the
    /// ambient [`ContextStore`]. Keys already bound are overwritten by
    /// `fields` on collision.
    pub fn bind(&self, fields: impl IntoIterator<Item = (String, Value)>) -> Logger {
        let mut bound = (*self.bound).clone();
        for (k, v) in fields {
            bound.insert(k, v);
        }
        Logger {
            inner: self.inner.clone(),
            floor: self.floor,
            bound: Arc::new(bound),
        }
    }

    /// Returns a new facade with `keys` removed from its local context
    /// map; does not mutate `self`.
    pub fn unbind(&self, keys: impl IntoIterator<Item = impl AsRef<str>>) -> Logger {
        let mut bound = (*self.bound).clone();
        for k in keys {
            bound.shift_remove(k.as_ref());
        }
        Logger {
            inner: self.inner.clone(),
            floor: self.floor,
            bound: Arc::new(bound),
        }
    }

    /// Logs one record. The severity floor is checked before any envelope
    /// is allocated. The envelope's context map is assembled from
    /// ambient context, overlaid by this facade's local bind map, with
    /// the bind map winning on key collision; `fields` are structured
    /// payload data, independent of both.
    pub async fn log(
        &self,
        level: Level,
        level_name: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) {
        if level < self.floor {
            return;
        }
        let mut envelope = Envelope::new(level, level_name, message);
        for (k, v) in ContextStore::get_ambient().into_map() {
            envelope.context.insert(k, v);
        }
        for (k, v) in self.bound.iter() {
            envelope.context.insert(k.clone(), v.clone());
        }
        for (k, v) in fields {
            envelope.data.insert(k, v);
        }
        self.submit(envelope).await;
    }

    async fn submit(&self, envelope: Envelope) {
        if let Some(filter) = &self.inner.trace_consistent_filter {
            if let Some(trace_id) = envelope.correlation.trace_id.as_deref() {
                if filter.decision_for(trace_id) == Some(true) {
                    self.inner.lifecycle.queue().submit_forced(envelope).await;
                    return;
                }
            }
        }
        self.inner.lifecycle.queue().submit(envelope).await;
    }

    pub async fn trace(&self, message: impl Into<String>) {
        self.log(Level::TRACE, "TRACE", message, []).await;
    }
    pub async fn debug(&self, message: impl Into<String>) {
        self.log(Level::DEBUG, "DEBUG", message, []).await;
    }
    pub async fn info(&self, message: impl Into<String>) {
        self.log(Level::INFO, "INFO", message, []).await;
    }
    pub async fn notice(&self, message: impl Into<String>) {
        self.log(Level::NOTICE, "NOTICE", message, []).await;
    }
    pub async fn warn(&self, message: impl Into<String>) {
        self.log(Level::WARN, "WARN", message, []).await;
    }
    pub async fn error(&self, message: impl Into<String>) {
        self.log(Level::ERROR, "ERROR", message, []).await;
    }
    pub async fn critical(&self, message: impl Into<String>) {
        self.log(Level::CRITICAL, "CRITICAL", message, []).await;
    }

    /// Blocks until every envelope submitted so far has been routed and
    /// written; does not stop the pipeline.
    pub async fn flush(&self) -> Duration {
        self.inner.lifecycle.flush().await
    }

    /// Drains and stops the pipeline. See [`LifecycleController::drain`].
    pub async fn drain(&self, timeout: Option<Duration>) -> DrainResult {
        self.inner.lifecycle.drain(timeout).await
    }

    pub fn metrics(&self) -> Snapshot {
        self.inner.lifecycle.metrics().snapshot()
    }
}

/// Builds and starts a [`Logger`]. Stages and sinks must be supplied
/// explicitly; [`Settings`] only covers queue, batching, and sink-agnostic
/// knobs, not plugin wiring.
pub struct LoggerBuilder {
    settings: Settings,
    enrichers: Vec<Arc<dyn Enricher>>,
    redactors: Vec<Arc<dyn Redactor>>,
    filters: Vec<Arc<dyn Filter>>,
    serializer: Option<Arc<dyn Serializer>>,
    sinks: Vec<SinkGroup>,
    trace_consistent_filter: Option<Arc<TraceConsistentSamplingFilter>>,
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            enrichers: Vec::new(),
            redactors: Vec::new(),
            filters: Vec::new(),
            serializer: None,
            sinks: Vec::new(),
            trace_consistent_filter: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactors.push(redactor);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Registers a trace-consistent sampling filter both as a regular
    /// filter stage and as the facade's consultation point for
    /// `sample_on_pressure` overrides. Must run before any other sampling
    /// filter in the stage order.
    pub fn with_trace_consistent_sampling(mut self, filter: Arc<TraceConsistentSamplingFilter>) -> Self {
        self.filters.push(filter.clone());
        self.trace_consistent_filter = Some(filter);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_sink(mut self, primary: SinkRoute) -> Self {
        self.sinks.push(SinkGroup { primary, fallback: None });
        self
    }

    pub fn with_sink_and_fallback(mut self, primary: SinkRoute, fallback: SinkRoute) -> Self {
        self.sinks.push(SinkGroup {
            primary,
            fallback: Some(fallback),
        });
        self
    }

    /// Starts every sink and the worker pool, returning a [`Logger`]
    /// handle plus a [`LoggerGuard`] that best-effort-drains on drop.
    pub async fn build(self) -> crate::error::Result<(Logger, LoggerGuard)> {
        self.settings.validate()?;

        let queue = BoundedQueue::new(self.settings.queue_capacity, self.settings.queue_policy.clone());
        let serializer = self.serializer.unwrap_or_else(|| match self.settings.format {
            Format::JsonLines => Arc::new(JsonLinesSerializer) as Arc<dyn Serializer>,
            Format::Pretty => Arc::new(PrettySerializer) as Arc<dyn Serializer>,
        });
        let stages = Arc::new(PipelineStages {
            enrichers: self.enrichers,
            redactors: self.redactors,
            filters: self.filters,
            serializer,
        });
        let metrics = Arc::new(Metrics::new());
        let diagnostics = Arc::new(DiagnosticsChannel::new());
        let groups = Arc::new(self.sinks);
        let batch_config = BatchConfig {
            max_count: self.settings.batch_max_count,
            max_bytes: self.settings.batch_max_bytes,
            batch_timeout: self.settings.batch_timeout,
            pull_size: (self.settings.batch_max_count * 2).max(1),
        };

        let lifecycle = Arc::new(
            LifecycleController::start(
                queue,
                stages,
                groups,
                self.settings.workers,
                batch_config,
                self.settings.shutdown_timeout,
                metrics,
                diagnostics,
            )
            .await?,
        );

        let inner = Arc::new(Inner {
            lifecycle: lifecycle.clone(),
            trace_consistent_filter: self.trace_consistent_filter,
        });

        let logger = Logger {
            inner,
            floor: self.settings.level,
            bound: Arc::new(IndexMap::new()),
        };
        let guard = LoggerGuard {
            lifecycle,
            shutdown_timeout: self.settings.shutdown_timeout,
        };
        Ok((logger, guard))
    }
}

/// Owns the pipeline's lifetime. Dropping it without calling
/// [`LoggerGuard::drain`] first best-effort-drains in a detached task,
/// since `Drop` cannot `.await` — call `drain` explicitly whenever the
/// caller can await it directly.
pub struct LoggerGuard {
    lifecycle: Arc<LifecycleController>,
    shutdown_timeout: Duration,
}

impl LoggerGuard {
    pub async fn drain(self, timeout: Option<Duration>) -> DrainResult {
        self.lifecycle.drain(timeout).await
    }
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.clone();
        let timeout = self.shutdown_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lifecycle.drain(Some(timeout)).await;
                });
            }
            Err(_) => {
                eprintln!("[fapilog] LoggerGuard dropped outside a tokio runtime; pipeline was not drained");
            }
        }
    }
}

static GLOBAL: OnceCell<Logger> = OnceCell::new();

/// Installs `logger` as the process-wide default, returned by
/// [`global`]. Only the first call takes effect; later calls are
/// ignored — the default is set once at startup and never swapped
/// afterward.
pub fn install_global(logger: Logger) {
    let _ = GLOBAL.set(logger);
}

/// Returns the process-wide default logger, if [`install_global`] has
/// been called.
pub fn global() -> Option<Logger> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::filter::LevelThresholdFilter;
    use crate::sink::{Health, Sink, SinkRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct CollectingSink {
        written: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sink for CollectingSink {
        fn name(&self) -> &str {
            "collecting"
        }
        async fn start(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn write(&self, _record: SinkRecord<'_>) -> std::io::Result<()> {
            self.written.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        async fn write_batch(&self, records: &[SinkRecord<'_>]) -> std::io::Result<()> {
            self.written.fetch_add(records.len(), std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn builder_rejects_empty_sink_list() {
        let err = Logger::builder().build().await.unwrap_err();
        assert!(matches!(err, Error::NoUsableSinks));
    }

    #[tokio::test]
    async fn log_below_floor_is_never_submitted() {
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CollectingSink { written: written.clone() });
        let (logger, guard) = Logger::builder()
            .with_sink(SinkRoute::primary(sink))
            .with_filter(Arc::new(LevelThresholdFilter::new(Level::WARN)))
            .build()
            .await
            .unwrap();
        let logger = logger.with_level(Level::WARN);

        logger.info("below the floor, never allocated").await;
        logger.error("above the floor").await;
        logger.flush().await;

        assert_eq!(written.load(std::sync::atomic::Ordering::Relaxed), 1);
        guard.drain(None).await;
    }

    #[tokio::test]
    async fn global_install_is_first_write_wins() {
        let written_a = Arc::new(AtomicUsize::new(0));
        let sink_a = Arc::new(CollectingSink { written: written_a.clone() });
        let (logger_a, guard_a) = Logger::builder().with_sink(SinkRoute::primary(sink_a)).build().await.unwrap();

        let written_b = Arc::new(AtomicUsize::new(0));
        let sink_b = Arc::new(CollectingSink { written: written_b.clone() });
        let (logger_b, guard_b) = Logger::builder().with_sink(SinkRoute::primary(sink_b)).build().await.unwrap();

        install_global(logger_a);
        install_global(logger_b);

        assert_eq!(global().unwrap().level(), Level::INFO);
        guard_a.drain(None).await;
        guard_b.drain(None).await;
    }

    struct CapturingSink {
        contexts: std::sync::Mutex<Vec<IndexMap<String, Value>>>,
    }

    #[async_trait]
    impl Sink for CapturingSink {
        fn name(&self) -> &str {
            "capturing"
        }
        async fn start(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn write(&self, record: SinkRecord<'_>) -> std::io::Result<()> {
            self.contexts.lock().unwrap().push(record.envelope.context.clone());
            Ok(())
        }
        async fn stop(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn bind_returns_new_logger_without_mutating_the_original() {
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CollectingSink { written: written.clone() });
        let (logger, guard) = Logger::builder().with_sink(SinkRoute::primary(sink)).build().await.unwrap();

        let bound = logger.bind([("request_id".to_string(), Value::from("r-1"))]);
        assert!(logger.bound.is_empty(), "bind must not mutate the original facade");
        assert_eq!(bound.bound.get("request_id"), Some(&Value::from("r-1")));

        let unbound = bound.unbind(["request_id"]);
        assert_eq!(bound.bound.get("request_id"), Some(&Value::from("r-1")), "unbind must not mutate its receiver");
        assert!(unbound.bound.is_empty());

        bound.info("with bound context").await;
        bound.flush().await;
        assert_eq!(written.load(std::sync::atomic::Ordering::Relaxed), 1);
        guard.drain(None).await;
    }

    #[tokio::test]
    async fn log_merges_ambient_bind_and_call_site_layers() {
        let sink = Arc::new(CapturingSink { contexts: std::sync::Mutex::new(Vec::new()) });
        let (logger, guard) = Logger::builder().with_sink(SinkRoute::primary(sink.clone())).build().await.unwrap();

        let bound = logger.bind([
            ("request_id".to_string(), Value::from("r-1")),
            ("tenant".to_string(), Value::from("from-bind")),
        ]);

        ContextStore::run_with_fresh_scope(async {
            ContextStore::bind([("tenant".to_string(), Value::from("from-ambient"))]);
            bound.info("hello").await;
        })
        .await;

        bound.flush().await;

        let captured = sink.contexts.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].get("request_id"), Some(&Value::from("r-1")));
        assert_eq!(
            captured[0].get("tenant"),
            Some(&Value::from("from-bind")),
            "facade-local bind must win over ambient context on collision"
        );

        guard.drain(None).await;
    }

    #[tokio::test]
    async fn guard_drop_outside_runtime_does_not_panic() {
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CollectingSink { written: written.clone() });
        let (_logger, guard) = Logger::builder().with_sink(SinkRoute::primary(sink)).build().await.unwrap();

        let dropped = Arc::new(AtomicBool::new(false));
        let dropped_clone = dropped.clone();
        std::thread::spawn(move || {
            drop(guard);
            dropped_clone.store(true, std::sync::atomic::Ordering::Relaxed);
        })
        .join()
        .unwrap();

        assert!(dropped.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[tokio::test]
    async fn degraded_sink_half_open_probe_does_not_block_logging() {
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CollectingSink { written: written.clone() });
        let route = SinkRoute::primary(sink);
        assert!(matches!(route.breaker.health(), Health::Healthy));
        let (logger, guard) = Logger::builder().with_sink(route).build().await.unwrap();

        logger.info("healthy path").await;
        logger.flush().await;
        assert_eq!(written.load(std::sync::atomic::Ordering::Relaxed), 1);
        guard.drain(None).await;
    }
}
