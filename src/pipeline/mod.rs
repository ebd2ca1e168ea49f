//! Stage contracts executed by workers: enrich → redact → filter → serialize.
//!
//! Grounded in `abitofhelp-adaptive_pipeline`'s `PipelineStage`/
//! `StageExecutor` trait-object dispatch (`stage_executor.rs`),
//! generalized to four capability families, with isolation added so a
//! plugin that fails repeatedly gets disabled after K failures within a
//! rolling window W rather than degrading every record.

pub mod enrich;
pub mod filter;
pub mod redact;
pub mod serialize;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;

use crate::envelope::Envelope;

/// What a redactor should do when it cannot complete matching within its
/// caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Warn,
    Closed,
}

/// Outcome of running one redactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactOutcome {
    Continue,
    DropEnvelope,
}

/// Declares the entrypoint/version metadata a discovered plugin manifest
/// carries.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub name: String,
    pub api_major: u32,
}

/// Host-supported plugin API major version. Bump only on breaking changes
/// to the stage traits below.
pub const HOST_API_MAJOR: u32 = 1;

impl PluginManifest {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.api_major != HOST_API_MAJOR {
            return Err(crate::error::Error::ApiVersionMismatch {
                name: self.name.clone(),
                declared: self.api_major,
                supported: HOST_API_MAJOR,
            });
        }
        Ok(())
    }
}

/// Observes and mutates the envelope by adding fields. Must not read
/// fields unrelated to its own concern, and must be idempotent.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;
    async fn enrich(&self, envelope: &mut Envelope);
}

/// Masks sensitive values in-place. Returns [`RedactOutcome::DropEnvelope`]
/// only when its `on_error` policy is `Closed` and a matching/caps failure
/// occurred.
#[async_trait]
pub trait Redactor: Send + Sync {
    fn name(&self) -> &str;
    fn on_error(&self) -> OnError;
    async fn redact(&self, envelope: &mut Envelope) -> RedactOutcome;
}

/// Decides whether an envelope continues to the next stage, and may mutate it.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    async fn filter(&self, envelope: &mut Envelope) -> bool;
}

/// Produces the final on-wire byte representation.
#[async_trait]
pub trait Serializer: Send + Sync {
    fn name(&self) -> &str;
    fn serialize(&self, envelope: &Envelope) -> Vec<u8>;
}

/// Per-plugin failure bookkeeping implementing "disabled after K failures
/// within W seconds, until the next lifecycle restart".
pub struct FailureBudget {
    max_failures: u32,
    window: Duration,
    failures: AtomicU32,
    window_start: parking_lot::Mutex<Instant>,
    disabled: std::sync::atomic::AtomicBool,
    total_failures: AtomicU64,
}

impl FailureBudget {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: AtomicU32::new(0),
            window_start: parking_lot::Mutex::new(Instant::now()),
            disabled: std::sync::atomic::AtomicBool::new(false),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Records one failure, tripping `disabled` if this pushes the count
    /// over `max_failures` inside the current window.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut start = self.window_start.lock();
        if start.elapsed() > self.window {
            *start = Instant::now();
            self.failures.store(0, Ordering::Relaxed);
        }
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.max_failures {
            self.disabled.store(true, Ordering::Release);
        }
    }

    /// Clears the disabled flag; called by the lifecycle controller on restart.
    pub fn reset(&self) {
        self.disabled.store(false, Ordering::Release);
        self.failures.store(0, Ordering::Relaxed);
        *self.window_start.lock() = Instant::now();
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        // K=5 failures within W=60s, a reasonable default absent a spec'd number.
        Self::new(5, Duration::from_secs(60))
    }
}

/// Runs `body` with panic isolation, translating a panic into a
/// diagnostic-worthy `Err` rather than unwinding into the worker loop.
/// `catch_unwind` is the direct mechanism; `AssertUnwindSafe` is safe
/// here because stages never leave
/// the envelope in a half-mutated state observable across the unwind
/// boundary (the worker discards the envelope on error, see `worker.rs`).
pub async fn isolated<F, T>(fut: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "stage panicked with a non-string payload".to_string()
            }
        })
}
