//! Output destinations and the uniform sink contract.

pub mod file;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::envelope::Envelope;

/// A record ready to be written: the envelope (for sinks that need to
/// re-derive routing/serialization) plus its pre-serialized bytes, so a
/// sink can skip re-serializing on the common path.
pub struct SinkRecord<'a> {
    pub envelope: &'a Envelope,
    pub serialized: &'a [u8],
}

/// Uniform asynchronous write contract every sink implements.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> crate::error::Result<()>;
    async fn write(&self, record: SinkRecord<'_>) -> std::io::Result<()>;
    async fn write_batch(&self, records: &[SinkRecord<'_>]) -> std::io::Result<()> {
        for record in records {
            self.write(SinkRecord {
                envelope: record.envelope,
                serialized: record.serialized,
            })
            .await?;
        }
        Ok(())
    }
    async fn stop(&self) -> std::io::Result<()>;
    async fn health_check(&self) -> bool;
}

/// Health state a sink's circuit breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Open,
}

/// Consecutive-failure counter with cooldown and half-open probe, shared
/// by every sink implementation rather than re-derived per sink.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    half_open_probe_in_flight: std::sync::atomic::AtomicBool,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            half_open_probe_in_flight: std::sync::atomic::AtomicBool::new(false),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn health(&self) -> Health {
        let mut opened_at = self.opened_at.lock();
        match *opened_at {
            None => Health::Healthy,
            Some(when) if when.elapsed() >= self.cooldown => {
                *opened_at = None;
                Health::Degraded // half-open: one probe write allowed
            }
            Some(_) => Health::Open,
        }
    }

    /// Call before issuing a write while [`Health::Degraded`] to claim the
    /// single half-open probe slot. Returns `false` if another write
    /// already claimed it.
    pub fn try_claim_probe(&self) -> bool {
        self.half_open_probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.opened_at.lock() = None;
        self.half_open_probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.half_open_probe_in_flight.store(false, Ordering::Release);
        let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.failure_threshold {
            *self.opened_at.lock() = Some(Instant::now());
            self.total_trips.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips.load(Ordering::Relaxed)
    }
}

/// A routable predicate over an envelope, used by [`SinkRoute`] to decide
/// whether a given sink should receive a record.
pub type RoutePredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// One sink plus its routing configuration.
pub struct SinkRoute {
    pub sink: Arc<dyn Sink>,
    pub breaker: CircuitBreaker,
    pub predicate: Option<RoutePredicate>,
    pub is_fallback: bool,
}

impl SinkRoute {
    pub fn primary(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            predicate: None,
            is_fallback: false,
        }
    }

    pub fn fallback(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            predicate: None,
            is_fallback: true,
        }
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(failure_threshold, cooldown);
        self
    }

    pub fn accepts(&self, envelope: &Envelope) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(envelope))
    }
}

/// A severity threshold routing predicate — the common case.
pub fn level_at_least(floor: crate::envelope::Level) -> RoutePredicate {
    Arc::new(move |envelope: &Envelope| envelope.level >= floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;

    #[test]
    fn circuit_breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        assert_eq!(breaker.health(), Health::Healthy);
        breaker.record_failure();
        assert_eq!(breaker.health(), Health::Healthy);
        breaker.record_failure();
        assert_eq!(breaker.health(), Health::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.health(), Health::Degraded);
        assert_eq!(breaker.total_trips(), 1);
    }

    #[test]
    fn circuit_breaker_probe_claim_is_single_use() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.health(), Health::Degraded);
        assert!(breaker.try_claim_probe());
        assert!(!breaker.try_claim_probe());
    }

    #[test]
    fn circuit_breaker_success_resets_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.health(), Health::Healthy);
    }

    #[test]
    fn level_at_least_predicate() {
        let pred = level_at_least(Level::WARN);
        let mut e = Envelope::new(Level::INFO, "INFO", "hi");
        assert!(!pred(&e));
        e.level = Level::ERROR;
        assert!(pred(&e));
    }
}
