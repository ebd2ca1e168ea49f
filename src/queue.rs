//! Bounded MPSC queue with selectable backpressure policies.
//!
//! Grounded in a `crossbeam_channel::unbounded` async-writer channel
//! pattern, generalized into a *bounded*, policy-driven structure:
//! crossbeam's channel has no notion of "evict oldest" or "sample under
//! pressure", so the queue here is a hand-rolled ring buffer behind a
//! short-held `parking_lot::Mutex`, woken via `tokio::sync::Notify` so
//! the async `block` policy can suspend the *task* rather than the OS
//! thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify};

use crate::envelope::{Envelope, Level};

/// Policy applied when the queue is at capacity.
#[derive(Debug, Clone)]
pub enum BackpressurePolicy {
    /// Discard the incoming submission; the facade returns immediately.
    DropNewest,
    /// Evict the oldest queued envelope to make room for the new one.
    DropOldest,
    /// Suspend the submitter until space frees up or `deadline` elapses.
    Block { deadline: Option<Duration> },
    /// Probabilistically drop submissions below `min_severity` as the
    /// queue fills, saturating to 100% at `high_water_mark`.
    SampleOnPressure {
        min_severity: Level,
        high_water_mark: f64,
    },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropNewest
    }
}

/// One barrier's completion signal, observable by whoever submitted it.
#[derive(Debug)]
pub struct BarrierHandle {
    rx: oneshot::Receiver<()>,
}

impl BarrierHandle {
    pub async fn completed(self) {
        let _ = self.rx.await;
    }
}

pub(crate) struct BarrierAck(oneshot::Sender<()>);

impl BarrierAck {
    pub(crate) fn signal(self) {
        let _ = self.0.send(());
    }
}

/// A tagged union of what can travel through the queue (internal worker contract).
pub(crate) enum QueueEntry {
    Envelope(Envelope),
    FlushBarrier(BarrierAck),
    ShutdownBarrier(BarrierAck),
}

/// Outcome of a single enqueue attempt, used to update [`crate::lifecycle::DrainResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    DroppedQueueFull,
    DroppedSampled,
    DroppedTimeout,
}

struct Inner {
    deque: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    policy: BackpressurePolicy,
    not_empty: Notify,
    not_full: Notify,
    depth_high_water: AtomicUsize,
    submitted: AtomicU64,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// The bounded MPSC queue sitting between producers and the worker pool.
#[derive(Clone)]
pub struct BoundedQueue {
    inner: Arc<Inner>,
}

impl BoundedQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                deque: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity,
                policy,
                not_empty: Notify::new(),
                not_full: Notify::new(),
                depth_high_water: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn depth_high_water(&self) -> usize {
        self.inner.depth_high_water.load(Ordering::Relaxed)
    }

    fn record_depth(&self, depth: usize) {
        let mut hwm = self.inner.depth_high_water.load(Ordering::Relaxed);
        while depth > hwm {
            match self.inner.depth_high_water.compare_exchange_weak(
                hwm,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => hwm = actual,
            }
        }
    }

    /// Rejects new submissions once a shutdown barrier has drained
    /// through; entries submitted after the barrier are rejected with a
    /// diagnostic.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.not_empty.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Attempts to enqueue `envelope` applying the configured policy.
    /// Never awaits except under `Block` — enqueue only suspends under
    /// `policy=block`.
    pub async fn submit(&self, envelope: Envelope) -> EnqueueOutcome {
        if self.is_closed() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::DroppedQueueFull;
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        match self.inner.policy.clone() {
            BackpressurePolicy::DropNewest => self.try_push_or_drop(envelope),
            BackpressurePolicy::DropOldest => self.push_evicting_oldest(envelope),
            BackpressurePolicy::Block { deadline } => self.push_blocking(envelope, deadline).await,
            BackpressurePolicy::SampleOnPressure {
                min_severity,
                high_water_mark,
            } => self.push_sampled(envelope, min_severity, high_water_mark),
        }
    }

    /// Enqueues `envelope` bypassing `SampleOnPressure`'s probabilistic
    /// draw (still subject to plain capacity). Used when a trace-consistent
    /// sampling decision has already admitted this envelope's trace id, so
    /// later records in the same trace must not be coin-flipped again.
    /// Under any other policy this behaves exactly like [`Self::submit`].
    pub async fn submit_forced(&self, envelope: Envelope) -> EnqueueOutcome {
        if self.is_closed() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::DroppedQueueFull;
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        match self.inner.policy.clone() {
            BackpressurePolicy::DropOldest => self.push_evicting_oldest(envelope),
            BackpressurePolicy::Block { deadline } => self.push_blocking(envelope, deadline).await,
            BackpressurePolicy::DropNewest | BackpressurePolicy::SampleOnPressure { .. } => {
                self.try_push_or_drop(envelope)
            }
        }
    }

    /// Enqueues a barrier unconditionally — barriers are never subject
    /// to a drop policy.
    pub fn submit_barrier(&self, shutdown: bool) -> BarrierHandle {
        let (tx, rx) = oneshot::channel();
        let entry = if shutdown {
            QueueEntry::ShutdownBarrier(BarrierAck(tx))
        } else {
            QueueEntry::FlushBarrier(BarrierAck(tx))
        };
        let depth = {
            let mut guard = self.inner.deque.lock();
            guard.push_back(entry);
            guard.len()
        };
        self.record_depth(depth);
        self.inner.not_empty.notify_one();
        BarrierHandle { rx }
    }

    fn try_push_or_drop(&self, envelope: Envelope) -> EnqueueOutcome {
        let mut guard = self.inner.deque.lock();
        if guard.len() >= self.inner.capacity {
            drop(guard);
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::DroppedQueueFull;
        }
        guard.push_back(QueueEntry::Envelope(envelope));
        let depth = guard.len();
        drop(guard);
        self.record_depth(depth);
        self.inner.not_empty.notify_one();
        EnqueueOutcome::Accepted
    }

    fn push_evicting_oldest(&self, envelope: Envelope) -> EnqueueOutcome {
        let mut guard = self.inner.deque.lock();
        if guard.len() >= self.inner.capacity {
            // Evict the oldest *envelope*, never a barrier — barriers must
            // still observe everything ahead of them.
            if let Some(pos) = guard
                .iter()
                .position(|e| matches!(e, QueueEntry::Envelope(_)))
            {
                guard.remove(pos);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        guard.push_back(QueueEntry::Envelope(envelope));
        let depth = guard.len();
        drop(guard);
        self.record_depth(depth);
        self.inner.not_empty.notify_one();
        EnqueueOutcome::Accepted
    }

    async fn push_blocking(&self, envelope: Envelope, deadline: Option<Duration>) -> EnqueueOutcome {
        let wait = async {
            loop {
                {
                    let mut guard = self.inner.deque.lock();
                    if guard.len() < self.inner.capacity {
                        guard.push_back(QueueEntry::Envelope(envelope));
                        let depth = guard.len();
                        drop(guard);
                        self.record_depth(depth);
                        self.inner.not_empty.notify_one();
                        return EnqueueOutcome::Accepted;
                    }
                }
                self.inner.not_full.notified().await;
            }
        };
        match deadline {
            None => wait.await,
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    EnqueueOutcome::DroppedTimeout
                }
            },
        }
    }

    fn push_sampled(&self, envelope: Envelope, min_severity: Level, high_water_mark: f64) -> EnqueueOutcome {
        let depth = self.len();
        let fill_ratio = depth as f64 / self.inner.capacity.max(1) as f64;

        if envelope.level >= min_severity {
            // Always-admitted severities still respect plain capacity.
            return self.try_push_or_drop(envelope);
        }

        let drop_fraction = if fill_ratio >= high_water_mark {
            1.0
        } else {
            // Linear ramp from 0 at empty to 1.0 at the high-water mark.
            (fill_ratio / high_water_mark.max(f64::EPSILON)).clamp(0.0, 1.0)
        };

        if drop_fraction >= 1.0 || rand::rng().random::<f64>() < drop_fraction {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::DroppedSampled;
        }
        self.try_push_or_drop(envelope)
    }

    /// Waits for at least one entry, then drains up to `max` entries in
    /// FIFO order. Returns an empty vec only if the queue is closed and
    /// drained.
    pub(crate) async fn pop_batch(&self, max: usize) -> Vec<QueueEntry> {
        loop {
            {
                let mut guard = self.inner.deque.lock();
                if !guard.is_empty() {
                    let n = max.min(guard.len());
                    let batch: Vec<QueueEntry> = guard.drain(..n).collect();
                    drop(guard);
                    self.inner.not_full.notify_waiters();
                    return batch;
                }
                if self.is_closed() {
                    return Vec::new();
                }
            }
            self.inner.not_empty.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn env(level: Level) -> Envelope {
        Envelope::new(level, level.builtin_name().unwrap_or("CUSTOM"), "msg")
    }

    #[tokio::test]
    async fn drop_newest_under_burst() {
        let q = BoundedQueue::new(4, BackpressurePolicy::DropNewest);
        for _ in 0..10 {
            q.submit(env(Level::INFO)).await;
        }
        assert_eq!(q.submitted(), 10);
        assert_eq!(q.len(), 4);
        assert_eq!(q.dropped(), 6);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_capacity_and_newest_entries() {
        let q = BoundedQueue::new(2, BackpressurePolicy::DropOldest);
        for i in 0..3i64 {
            let mut e = env(Level::INFO);
            e.data.insert("i".to_string(), crate::envelope::Value::Int(i));
            q.submit(e).await;
        }
        assert_eq!(q.len(), 2);
        let batch = q.pop_batch(2).await;
        let first = match &batch[0] {
            QueueEntry::Envelope(e) => e.data.get("i").cloned(),
            _ => None,
        };
        // entry 0 was evicted, 1 and 2 remain
        assert_eq!(first, Some(crate::envelope::Value::Int(1)));
    }

    #[tokio::test]
    async fn fifo_order_preserved_per_producer() {
        let q = BoundedQueue::new(100, BackpressurePolicy::DropNewest);
        for i in 0..10i64 {
            let mut e = env(Level::INFO);
            e.data.insert("i".to_string(), crate::envelope::Value::Int(i));
            q.submit(e).await;
        }
        let batch = q.pop_batch(100).await;
        let order: Vec<i64> = batch
            .into_iter()
            .filter_map(|entry| match entry {
                QueueEntry::Envelope(e) => match e.data.get("i") {
                    Some(crate::envelope::Value::Int(n)) => Some(*n),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn block_policy_times_out_and_counts_as_dropped() {
        let q = BoundedQueue::new(1, BackpressurePolicy::Block {
            deadline: Some(Duration::from_millis(20)),
        });
        q.submit(env(Level::INFO)).await;
        let outcome = q.submit(env(Level::INFO)).await;
        assert_eq!(outcome, EnqueueOutcome::DroppedTimeout);
    }

    #[tokio::test]
    async fn block_policy_unblocks_once_space_frees() {
        let q = BoundedQueue::new(1, BackpressurePolicy::Block { deadline: None });
        q.submit(env(Level::INFO)).await;

        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.submit(env(Level::INFO)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let popped = q.pop_batch(1).await;
        assert_eq!(popped.len(), 1);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Accepted);
    }

    #[tokio::test]
    async fn barrier_not_subject_to_drop_policy() {
        let q = BoundedQueue::new(1, BackpressurePolicy::DropNewest);
        q.submit(env(Level::INFO)).await;
        let handle = q.submit_barrier(false);
        assert_eq!(q.len(), 2);
        let batch = q.pop_batch(2).await;
        assert!(matches!(batch[1], QueueEntry::FlushBarrier(_)));
        for entry in batch {
            if let QueueEntry::FlushBarrier(ack) = entry {
                ack.signal();
            }
        }
        handle.completed().await;
    }

    #[tokio::test]
    async fn sample_on_pressure_always_admits_high_severity() {
        let q = BoundedQueue::new(10, BackpressurePolicy::SampleOnPressure {
            min_severity: Level::ERROR,
            high_water_mark: 0.5,
        });
        for _ in 0..10 {
            q.submit(env(Level::CRITICAL)).await;
        }
        assert_eq!(q.len(), 10);
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_submissions() {
        let q = BoundedQueue::new(4, BackpressurePolicy::DropNewest);
        q.close();
        let outcome = q.submit(env(Level::INFO)).await;
        assert_eq!(outcome, EnqueueOutcome::DroppedQueueFull);
    }
}
