//! SLAM System - entry point and thread orchestration.
//!
//! The `SlamSystem` owns the shared estimator and spawns one laser SLAM
//! worker thread per track. Scans are routed to workers over bounded
//! channels; loop closures are processed on the calling thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Sender};
use tracing::info;

use crate::common::RelativePose;
use crate::config::EstimatorParams;
use crate::estimator::{self, IncrementalEstimator};
use crate::optimizer::Values;

use super::messages::ScanMsg;
use super::shared_state::SharedState;
use super::worker::spawn_worker;

/// Capacity of each worker's scan channel.
/// When a channel is full, `process_scan` blocks briefly.
const SCAN_CHANNEL_CAPACITY: usize = 16;

/// Poll interval of `wait_idle`.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Multi-worker laser SLAM system.
pub struct SlamSystem {
    shared: Arc<SharedState>,

    /// One scan sender per worker, indexed by worker id.
    senders: Vec<Sender<ScanMsg>>,

    handles: Vec<JoinHandle<Result<()>>>,
}

impl SlamSystem {
    /// Create the shared estimator and spawn `n_workers` worker threads.
    pub fn new(params: EstimatorParams, n_workers: usize) -> Result<Self> {
        let estimator = IncrementalEstimator::new(params, n_workers);
        Self::with_estimator(Arc::new(estimator))
    }

    /// Spawn one worker per track of an existing estimator.
    pub fn with_estimator(estimator: Arc<IncrementalEstimator>) -> Result<Self> {
        let n_workers = estimator.n_workers();
        if n_workers == 0 {
            bail!("a SLAM system needs at least one worker");
        }

        let shared = SharedState::new(estimator);
        let mut senders = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let (sender, receiver) = bounded::<ScanMsg>(SCAN_CHANNEL_CAPACITY);
            handles.push(spawn_worker(worker_id, shared.clone(), receiver)?);
            senders.push(sender);
        }
        info!("SLAM system started with {} workers", n_workers);

        Ok(Self {
            shared,
            senders,
            handles,
        })
    }

    /// Queue a scan for the worker owning track `worker_id`.
    pub fn process_scan(&self, worker_id: usize, msg: ScanMsg) -> Result<()> {
        let Some(sender) = self.senders.get(worker_id) else {
            bail!(
                "worker {} does not exist ({} workers running)",
                worker_id,
                self.senders.len()
            );
        };

        self.shared.begin_scan(worker_id);
        if sender.send(msg).is_err() {
            self.shared.finish_scan(worker_id);
            bail!("worker {} has stopped", worker_id);
        }
        Ok(())
    }

    /// Process a loop closure on the calling thread.
    pub fn process_loop_closure(&self, loop_closure: &RelativePose) -> estimator::Result<Values> {
        self.shared.estimator.process_loop_closure(loop_closure)
    }

    /// Block until every queued scan has been processed or a worker failed.
    pub fn wait_idle(&self) {
        while self.shared.pending_scans() > 0 && !self.shared.has_worker_failed() {
            thread::sleep(IDLE_POLL);
        }
    }

    pub fn estimator(&self) -> &Arc<IncrementalEstimator> {
        &self.shared.estimator
    }

    pub fn n_workers(&self) -> usize {
        self.shared.estimator.n_workers()
    }

    /// Close all scan channels, let workers drain their queues, and wait for
    /// them. Returns the first worker error.
    pub fn shutdown(&mut self) -> Result<()> {
        self.senders.clear();
        self.join_workers()
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut first_error = None;
        for (worker_id, handle) in self.handles.drain(..).enumerate() {
            let outcome = handle
                .join()
                .map_err(|_| anyhow!("worker {} panicked", worker_id))
                .and_then(|result| result);
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.request_shutdown();
        self.senders.clear();
        let _ = self.join_workers();
    }
}
