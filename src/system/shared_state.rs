//! State shared between the `SlamSystem` handle and its worker threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::estimator::IncrementalEstimator;

/// Shared state accessible by every worker thread.
pub struct SharedState {
    /// The estimator all workers submit to. It serializes access internally.
    pub estimator: Arc<IncrementalEstimator>,

    /// Scans sent to each worker and not yet processed.
    pending_scans: Vec<AtomicUsize>,

    /// Set when a worker stopped on an error.
    worker_failed: AtomicBool,

    /// Request workers to exit without draining their queues.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(estimator: Arc<IncrementalEstimator>) -> Arc<Self> {
        let n_workers = estimator.n_workers();
        Arc::new(Self {
            estimator,
            pending_scans: (0..n_workers).map(|_| AtomicUsize::new(0)).collect(),
            worker_failed: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Record a scan queued for `worker_id`.
    pub fn begin_scan(&self, worker_id: usize) {
        if let Some(pending) = self.pending_scans.get(worker_id) {
            pending.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Record a scan of `worker_id` as processed (successfully or not).
    pub fn finish_scan(&self, worker_id: usize) {
        if let Some(pending) = self.pending_scans.get(worker_id) {
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Total number of queued or in-flight scans.
    pub fn pending_scans(&self) -> usize {
        self.pending_scans
            .iter()
            .map(|p| p.load(Ordering::SeqCst))
            .sum()
    }

    pub fn set_worker_failed(&self) {
        self.worker_failed.store(true, Ordering::SeqCst);
    }

    pub fn has_worker_failed(&self) -> bool {
        self.worker_failed.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
