//! Laser SLAM worker thread.
//!
//! Each worker owns one track and hands every received scan to
//! [`IncrementalEstimator::process_pose_and_scan`], which appends it to the
//! track, submits its factors and pushes the new estimate into all tracks
//! in one locked step.
//!
//! [`IncrementalEstimator::process_pose_and_scan`]: crate::estimator::IncrementalEstimator::process_pose_and_scan

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use super::messages::ScanMsg;
use super::shared_state::SharedState;

/// Timeout for receiving scans. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub scans_processed: usize,
    pub priors_registered: usize,
}

pub struct LaserSlamWorker {
    worker_id: usize,
    shared: Arc<SharedState>,
    stats: WorkerStats,
}

impl LaserSlamWorker {
    pub fn new(worker_id: usize, shared: Arc<SharedState>) -> Result<Self> {
        let n_tracks = shared.estimator.n_workers();
        if worker_id >= n_tracks {
            bail!("no laser track for worker {} ({} tracks)", worker_id, n_tracks);
        }
        Ok(Self {
            worker_id,
            shared,
            stats: WorkerStats::default(),
        })
    }

    /// Process scans until the channel is closed and drained, or shutdown is
    /// requested. Stops on the first error.
    pub fn run(&mut self, receiver: Receiver<ScanMsg>) -> Result<()> {
        info!("Laser SLAM worker {} started", self.worker_id);

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    let result = self.process_scan(msg);
                    self.shared.finish_scan(self.worker_id);
                    if let Err(e) = result {
                        error!("Laser SLAM worker {} stopped: {:#}", self.worker_id, e);
                        self.shared.set_worker_failed();
                        return Err(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "Laser SLAM worker {} exiting. Stats: scans={}, priors={}",
            self.worker_id, self.stats.scans_processed, self.stats.priors_registered
        );
        Ok(())
    }

    fn process_scan(&mut self, msg: ScanMsg) -> Result<()> {
        let time_ns = msg.time_ns;
        let is_first = self.stats.scans_processed == 0;

        let result = self
            .shared
            .estimator
            .process_pose_and_scan(self.worker_id, msg.time_ns, msg.odometry, msg.scan)
            .with_context(|| format!("ingesting scan at {} ns", time_ns))?;

        if is_first {
            self.stats.priors_registered += 1;
        }
        self.stats.scans_processed += 1;
        debug!(
            "Worker {}: scan at {} ns processed, estimate holds {} poses",
            self.worker_id,
            time_ns,
            result.len()
        );
        Ok(())
    }
}

/// Spawn a worker thread.
pub fn spawn_worker(
    worker_id: usize,
    shared: Arc<SharedState>,
    receiver: Receiver<ScanMsg>,
) -> Result<thread::JoinHandle<Result<()>>> {
    let mut worker = LaserSlamWorker::new(worker_id, shared)?;
    let handle = thread::Builder::new()
        .name(format!("laser-slam-worker-{}", worker_id))
        .spawn(move || worker.run(receiver))
        .context("failed to spawn laser SLAM worker thread")?;
    Ok(handle)
}
