//! Rate-limited internal fault channel.
//!
//! Grounded in an internal debug logger pattern (`utils/debug.rs`, a
//! lightweight `eprintln!`-based self-log guarded by an env var),
//! generalized into a bounded channel with per-`(source, reason)` rate
//! limiting and an optional self-sink, using `crossbeam_channel` for the
//! bounded internal transport, the same channel used by the async
//! writer thread (`backend/async.rs`).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::envelope::{Envelope, Level, Origin};

thread_local! {
    static IN_DIAGNOSTIC: Cell<bool> = const { Cell::new(false) };
}

/// A per-key token bucket. Shared by the diagnostics channel (keyed on
/// `(source, reason)`) and the rate-limiting filter plugin (keyed on
/// caller-supplied field values) per the Design Notes' "one RateLimiter
/// type serves both".
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<AHashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            buckets: Mutex::new(AHashMap::new()),
        }
    }

    /// Returns `true` if a token was available and consumed for `key`.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: Instant::now(),
        });
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        // 1/sec sustained, burst of 10.
        Self::new(10.0, 1.0)
    }
}

/// One internal fault report.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub source: String,
    pub reason: String,
}

/// Sink for [`Diagnostic`]s: rate-limits, prints a compact stderr line,
/// optionally mirrors into a configured self-sink, and guards against
/// recursive self-logging.
pub struct DiagnosticsChannel {
    limiter: RateLimiter,
    suppressed: AtomicU64,
    self_sink: Mutex<Option<Box<dyn Fn(Envelope) + Send + Sync>>>,
}

impl DiagnosticsChannel {
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::default(),
            suppressed: AtomicU64::new(0),
            self_sink: Mutex::new(None),
        }
    }

    /// Installs a self-sink: diagnostics are additionally recorded as
    /// normal envelopes with `origin=native`.
    pub fn set_self_sink(&self, sink: impl Fn(Envelope) + Send + Sync + 'static) {
        *self.self_sink.lock() = Some(Box::new(sink));
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Reports one fault. No-op (besides the internal tracing event) if
    /// called re-entrantly from within diagnostics handling itself.
    pub fn report(&self, source: &str, reason: impl Into<String>) {
        if IN_DIAGNOSTIC.with(|f| f.get()) {
            tracing::trace!(source, "suppressed re-entrant diagnostic");
            return;
        }
        let reason = reason.into();
        let key = format!("{source}\0{reason}");
        if !self.limiter.try_acquire(&key) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        IN_DIAGNOSTIC.with(|f| f.set(true));
        eprintln!("[fapilog] {source}: {reason}");
        tracing::warn!(source, reason = %reason, "pipeline diagnostic");

        if let Some(sink) = self.self_sink.lock().as_ref() {
            let mut envelope = Envelope::new(Level::WARN, "WARN", reason.clone());
            envelope.origin = Origin::Native;
            envelope.data.insert(
                "diagnostic_source".to_string(),
                crate::envelope::Value::Str(source.to_string()),
            );
            sink(envelope);
        }
        IN_DIAGNOSTIC.with(|f| f.set(false));
    }
}

impl Default for DiagnosticsChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rate_limiter_exhausts_burst_then_blocks() {
        let limiter = RateLimiter::new(2.0, 1.0);
        assert!(limiter.try_acquire("k"));
        assert!(limiter.try_acquire("k"));
        assert!(!limiter.try_acquire("k"));
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let limiter = RateLimiter::new(1.0, 1000.0);
        assert!(limiter.try_acquire("k"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire("k"));
    }

    #[test]
    fn diagnostics_channel_rate_limits_per_source_reason() {
        let channel = DiagnosticsChannel::new();
        for _ in 0..20 {
            channel.report("sink:file", "write failed");
        }
        assert!(channel.suppressed_count() > 0);
    }

    #[test]
    fn diagnostics_channel_invokes_self_sink() {
        let channel = DiagnosticsChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        channel.set_self_sink(move |env| seen2.lock().push(env.message));
        channel.report("worker", "stage panicked");
        assert_eq!(seen.lock().len(), 1);
    }
}
