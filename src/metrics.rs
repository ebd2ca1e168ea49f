//! Ambient lock-free counters feeding [`crate::lifecycle::DrainResult`].
//!
//! Not a Prometheus exporter — just the in-process atomic counter
//! surface an exporter would poll.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub submitted: AtomicU64,
    pub processed: AtomicU64,
    pub dropped: AtomicU64,
    pub filtered: AtomicU64,
    pub retried: AtomicU64,
    pub bytes_written: AtomicU64,
    pub rotations: AtomicU64,
    pub retention_deletes: AtomicU64,
    pub queue_depth_high_water: AtomicUsize,
}

/// Point-in-time read of every counter, cheap to take repeatedly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub submitted: u64,
    pub processed: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub retried: u64,
    pub bytes_written: u64,
    pub rotations: u64,
    pub retention_deletes: u64,
    pub queue_depth_high_water: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            retention_deletes: self.retention_deletes.load(Ordering::Relaxed),
            queue_depth_high_water: self.queue_depth_high_water.load(Ordering::Relaxed),
        }
    }

    pub fn record_queue_depth_high_water(&self, depth: usize) {
        let mut hwm = self.queue_depth_high_water.load(Ordering::Relaxed);
        while depth > hwm {
            match self.queue_depth_high_water.compare_exchange_weak(
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
}
