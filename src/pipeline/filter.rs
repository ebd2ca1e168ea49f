//! Built-in filters.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::num::NonZeroUsize;

use crate::diagnostics::RateLimiter;
use crate::envelope::{Envelope, Level};
use crate::pipeline::Filter;

/// Drops envelopes below a configured severity floor.
pub struct LevelThresholdFilter {
    floor: Level,
}

impl LevelThresholdFilter {
    pub fn new(floor: Level) -> Self {
        Self { floor }
    }
}

#[async_trait]
impl Filter for LevelThresholdFilter {
    fn name(&self) -> &str {
        "level_threshold"
    }

    async fn filter(&self, envelope: &mut Envelope) -> bool {
        envelope.level >= self.floor
    }
}

fn hash_fraction(key: &str) -> f64 {
    // FNV-1a: stable across runs and processes, unlike `ahash`'s randomized seed,
    // which matters here because the same key must map to the same fraction
    // deterministically.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash as f64) / (u64::MAX as f64)
}

/// Keeps a configurable fraction of envelopes. When `seed_key_field` names
/// a context/data field, the keep decision is a deterministic function of
/// that field's value rather than a coin flip, so the same key always
/// samples the same way.
pub struct ProbabilisticSamplingFilter {
    keep_fraction: f64,
    seed_key_field: Option<String>,
}

impl ProbabilisticSamplingFilter {
    pub fn new(keep_fraction: f64) -> Self {
        Self {
            keep_fraction: keep_fraction.clamp(0.0, 1.0),
            seed_key_field: None,
        }
    }

    pub fn with_seed_key_field(mut self, field: impl Into<String>) -> Self {
        self.seed_key_field = Some(field.into());
        self
    }
}

#[async_trait]
impl Filter for ProbabilisticSamplingFilter {
    fn name(&self) -> &str {
        "probabilistic_sampling"
    }

    async fn filter(&self, envelope: &mut Envelope) -> bool {
        if self.keep_fraction >= 1.0 {
            return true;
        }
        if self.keep_fraction <= 0.0 {
            return false;
        }
        if let Some(field) = &self.seed_key_field {
            if let Some(value) = envelope.context.get(field).or_else(|| envelope.data.get(field)) {
                let key = format!("{value:?}");
                return hash_fraction(&key) < self.keep_fraction;
            }
        }
        rand::rng().random::<f64>() < self.keep_fraction
    }
}

/// Drops envelopes once a per-key token bucket is exhausted. Shares
/// [`RateLimiter`] with the diagnostics channel.
pub struct RateLimitFilter {
    limiter: RateLimiter,
    key_field: Option<String>,
}

impl RateLimitFilter {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            limiter: RateLimiter::new(capacity, refill_per_second),
            key_field: None,
        }
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }
}

#[async_trait]
impl Filter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn filter(&self, envelope: &mut Envelope) -> bool {
        let key = match &self.key_field {
            Some(field) => envelope
                .context
                .get(field)
                .or_else(|| envelope.data.get(field))
                .map(|v| format!("{v:?}"))
                .unwrap_or_default(),
            None => String::new(),
        };
        self.limiter.try_acquire(&key)
    }
}

/// Accept-all-or-none within the same trace id. The decision
/// for a trace id, once made, is cached so every subsequent record
/// sharing that id gets the same verdict — this is also what lets
/// [`crate::queue::BackpressurePolicy::SampleOnPressure`] defer to this
/// filter per the Design Notes' trace-consistency resolution.
pub struct TraceConsistentSamplingFilter {
    keep_fraction: f64,
    decisions: Mutex<LruCache<String, bool>>,
}

impl TraceConsistentSamplingFilter {
    pub fn new(keep_fraction: f64, cache_capacity: usize) -> Self {
        Self {
            keep_fraction: keep_fraction.clamp(0.0, 1.0),
            decisions: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Returns the cached keep/drop decision for `trace_id`, if this
    /// trace has already been sampled. Consulted by the queue's
    /// `sample_on_pressure` policy so it never contradicts a trace this
    /// filter already admitted.
    pub fn decision_for(&self, trace_id: &str) -> Option<bool> {
        self.decisions.lock().get(trace_id).copied()
    }
}

#[async_trait]
impl Filter for TraceConsistentSamplingFilter {
    fn name(&self) -> &str {
        "trace_consistent_sampling"
    }

    async fn filter(&self, envelope: &mut Envelope) -> bool {
        let Some(trace_id) = envelope.correlation.trace_id.clone() else {
            return rand::rng().random::<f64>() < self.keep_fraction;
        };
        let mut decisions = self.decisions.lock();
        if let Some(decision) = decisions.get(&trace_id) {
            return *decision;
        }
        let keep = rand::rng().random::<f64>() < self.keep_fraction;
        decisions.put(trace_id, keep);
        keep
    }
}
