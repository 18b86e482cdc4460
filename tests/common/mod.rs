#![allow(dead_code)]

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;
use rand::prelude::*;

use rust_lslam::common::{PointCloud, Time};
use rust_lslam::config::EstimatorParams;
use rust_lslam::estimator::IncrementalEstimator;
use rust_lslam::geometry::SE3;
use rust_lslam::matching::{IcpConfig, IcpMatcher};
use rust_lslam::optimizer::{
    Factor, FactorGraph, FactorIndex, IncrementalSmoother, OptimizerBackend, OptimizerError,
    UpdateResult, Values,
};

/// One call to `OptimizerBackend::update`.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub new_factors: Vec<Factor>,
    pub removed: Vec<FactorIndex>,
    pub assigned: Vec<FactorIndex>,
}

pub type UpdateLog = Arc<Mutex<Vec<UpdateRecord>>>;

/// Smoother wrapper that records every update it receives.
pub struct RecordingBackend {
    inner: IncrementalSmoother,
    log: UpdateLog,
}

impl OptimizerBackend for RecordingBackend {
    fn update(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
        remove_factor_indices: &[FactorIndex],
    ) -> Result<UpdateResult, OptimizerError> {
        let submitted: Vec<Factor> = new_factors.iter().cloned().collect();
        let result = self
            .inner
            .update(new_factors, new_values, remove_factor_indices)?;
        self.log.lock().push(UpdateRecord {
            new_factors: submitted,
            removed: remove_factor_indices.to_vec(),
            assigned: result.new_factor_indices.clone(),
        });
        Ok(result)
    }

    fn calculate_estimate(&self) -> Values {
        self.inner.calculate_estimate()
    }

    fn num_factors(&self) -> usize {
        self.inner.num_factors()
    }
}

pub fn recording_estimator(
    params: EstimatorParams,
    n_workers: usize,
) -> (Arc<IncrementalEstimator>, UpdateLog) {
    let log = UpdateLog::default();
    let backend = RecordingBackend {
        inner: IncrementalSmoother::new(params.smoother_params()),
        log: Arc::clone(&log),
    };
    let matcher = IcpMatcher::new(IcpConfig {
        outlier_ratio: 0.0,
        ..Default::default()
    });
    let estimator =
        IncrementalEstimator::with_collaborators(params, n_workers, Box::new(backend), Box::new(matcher));
    (Arc::new(estimator), log)
}

/// Feed one pose the way a worker does.
pub fn ingest(
    estimator: &IncrementalEstimator,
    worker_id: usize,
    time_ns: Time,
    odometry: SE3,
    scan: PointCloud,
) -> Values {
    estimator
        .process_pose_and_scan(worker_id, time_ns, odometry, scan)
        .unwrap()
}

/// Drive worker `worker_id` along `poses`, stamped with `times`, without scans.
pub fn ingest_trajectory(
    estimator: &IncrementalEstimator,
    worker_id: usize,
    times: &[Time],
    poses: &[SE3],
) {
    for (&t, pose) in times.iter().zip(poses) {
        ingest(estimator, worker_id, t, *pose, PointCloud::new());
    }
}

/// Poses along +x, one meter apart, starting at `origin`.
pub fn straight_line(origin: Vector3<f64>, n: usize) -> Vec<SE3> {
    (0..n)
        .map(|i| SE3::from_yaw_translation(0.0, origin + Vector3::new(i as f64, 0.0, 0.0)))
        .collect()
}

/// `[0, 10, ..., 100]`: eleven poses spanning [0, 100] ns.
pub fn times_0_to_100() -> Vec<Time> {
    (0..=10).map(|i| i * 10).collect()
}

pub fn random_landmarks(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-5.0..25.0),
                rng.gen_range(-10.0..10.0),
                rng.gen_range(-2.0..2.0),
            )
        })
        .collect()
}

/// Noise-free scan of the landmarks within 8 m of `pose`, in the sensor frame.
pub fn scan_at(pose: &SE3, landmarks: &[Vector3<f64>]) -> PointCloud {
    let t_s_w = pose.inverse();
    PointCloud::from_points(
        landmarks
            .iter()
            .filter(|l| (*l - pose.translation).norm() < 8.0)
            .map(|l| t_s_w.transform_point(l))
            .collect(),
    )
}
