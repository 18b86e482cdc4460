//! Shared incremental estimator for several laser SLAM workers.
//!
//! One optimizer and N laser tracks live behind a single mutex. Every public
//! operation takes the lock exactly once and runs one of the `*_locked`
//! routines of [`EstimatorCore`]; those routines call each other directly so
//! that a loop closure can submit its factor without re-entering the lock.
//!
//! Lock order: estimator mutex first, then individual track locks. Poses are
//! appended to a track and submitted to the optimizer under the same lock
//! acquisition, so a track never holds a pose the optimizer has not seen.

use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{PointCloud, RelativePose, Time, TrackId};
use crate::config::EstimatorParams;
use crate::geometry::SE3;
use crate::matching::{IcpConfig, IcpMatcher, ScanMatcher};
use crate::optimizer::{
    Factor, FactorGraph, FactorIndex, IncrementalSmoother, NoiseModel, OptimizerBackend,
    UpdateResult, Values,
};
use crate::track::{LaserTrack, SharedLaserTrack};

use super::error::{EstimatorError, Result};

/// Worker whose registered prior is the replaceable one.
pub const ANCHOR_WORKER_ID: usize = 1;

/// Cauchy kernel parameter of the robust loop-closure noise model.
const LOOP_CLOSURE_CAUCHY_K: f64 = 1.0;

/// Empty optimizer updates issued after each submission. The smoother only
/// relinearizes at the start of an update, so a fresh submission needs two
/// more passes before the estimate reflects it.
const SETTLING_UPDATES: usize = 2;

/// State guarded by the estimator mutex.
struct EstimatorCore {
    backend: Box<dyn OptimizerBackend>,
    laser_tracks: Vec<SharedLaserTrack>,
    loop_closure_noise: NoiseModel,
    scan_matcher: Box<dyn ScanMatcher>,

    /// Index of the prior removed by the next `estimate_and_remove`.
    replaceable_prior: Option<FactorIndex>,
}

/// Pose-graph estimator shared by all laser SLAM workers.
pub struct IncrementalEstimator {
    params: EstimatorParams,
    n_workers: usize,
    core: Mutex<EstimatorCore>,
}

impl IncrementalEstimator {
    /// Create an estimator with the in-crate smoother and ICP matcher.
    ///
    /// The ICP configuration is read from
    /// `params.laser_track.icp_configuration_file`; if it cannot be loaded the
    /// default configuration is used.
    pub fn new(params: EstimatorParams, n_workers: usize) -> Self {
        let backend = IncrementalSmoother::new(params.smoother_params());
        let icp_config = load_icp_config(&params.laser_track.icp_configuration_file);
        let matcher = IcpMatcher::new(icp_config);
        Self::with_collaborators(params, n_workers, Box::new(backend), Box::new(matcher))
    }

    /// Create an estimator around an existing optimizer and scan matcher.
    pub fn with_collaborators(
        params: EstimatorParams,
        n_workers: usize,
        backend: Box<dyn OptimizerBackend>,
        scan_matcher: Box<dyn ScanMatcher>,
    ) -> Self {
        let laser_tracks = (0..n_workers)
            .map(|id| LaserTrack::shared(params.laser_track.clone(), id))
            .collect();

        let loop_closure_noise = if params.add_m_estimator_on_loop_closures {
            info!("Creating loop closure noise model with Cauchy M-estimator");
            NoiseModel::robust_cauchy(LOOP_CLOSURE_CAUCHY_K, params.loop_closure_noise_model)
        } else {
            info!("Creating diagonal loop closure noise model");
            NoiseModel::diagonal(params.loop_closure_noise_model)
        };

        let core = EstimatorCore {
            backend,
            laser_tracks,
            loop_closure_noise,
            scan_matcher,
            replaceable_prior: None,
        };

        Self {
            params,
            n_workers,
            core: Mutex::new(core),
        }
    }

    /// Validate, optionally refine and submit a loop closure, replacing the
    /// anchor prior. The new estimate is pushed into every track and returned.
    pub fn process_loop_closure(&self, loop_closure: &RelativePose) -> Result<Values> {
        self.core
            .lock()
            .process_loop_closure_locked(loop_closure, &self.params)
    }

    /// Append a pose and its scan to track `worker_id` and submit the factors
    /// it contributes: a prior through `register_prior` for the first pose of
    /// the track, an odometry factor through `estimate` afterwards.
    ///
    /// The new estimate is pushed into every track and returned. If the
    /// optimizer rejects the submission the pose is dropped from the track.
    pub fn process_pose_and_scan(
        &self,
        worker_id: usize,
        time_ns: Time,
        odometry: SE3,
        scan: PointCloud,
    ) -> Result<Values> {
        self.core
            .lock()
            .process_pose_and_scan_locked(worker_id, time_ns, odometry, scan)
    }

    /// Submit new factors and variables without removing anything.
    pub fn estimate(&self, new_factors: FactorGraph, new_values: Values) -> Result<Values> {
        self.core.lock().estimate_locked(new_factors, new_values)
    }

    /// Submit new factors and variables and remove the replaceable prior.
    pub fn estimate_and_remove(
        &self,
        new_factors: FactorGraph,
        new_values: Values,
    ) -> Result<Values> {
        self.core
            .lock()
            .estimate_and_remove_locked(new_factors, new_values)
    }

    /// Submit a single prior factor on behalf of `worker_id`.
    ///
    /// When `worker_id` is [`ANCHOR_WORKER_ID`] the index assigned to the
    /// prior becomes the replaceable prior.
    pub fn register_prior(
        &self,
        new_factors: FactorGraph,
        new_values: Values,
        worker_id: usize,
    ) -> Result<Values> {
        self.core
            .lock()
            .register_prior_locked(new_factors, new_values, worker_id)
    }

    /// Shared handle to the track of worker `id`.
    pub fn laser_track(&self, id: TrackId) -> Result<SharedLaserTrack> {
        let core = self.core.lock();
        core.laser_tracks.get(id).cloned().ok_or_else(|| {
            EstimatorError::InvariantViolation(format!(
                "laser track {} requested, only {} exist",
                id,
                core.laser_tracks.len()
            ))
        })
    }

    /// Index of the prior that the next `estimate_and_remove` will remove.
    pub fn replaceable_prior(&self) -> Option<FactorIndex> {
        self.core.lock().replaceable_prior
    }

    /// Number of factors currently held by the optimizer.
    pub fn num_factors(&self) -> usize {
        self.core.lock().backend.num_factors()
    }

    /// Current estimate of every variable, without updating the optimizer.
    pub fn current_estimate(&self) -> Values {
        self.core.lock().backend.calculate_estimate()
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    pub fn params(&self) -> &EstimatorParams {
        &self.params
    }
}

impl EstimatorCore {
    fn process_loop_closure_locked(
        &mut self,
        loop_closure: &RelativePose,
        params: &EstimatorParams,
    ) -> Result<Values> {
        self.validate_loop_closure(loop_closure)?;

        let loop_closure = if params.do_icp_step_on_loop_closures {
            let refined =
                self.refine_loop_closure(loop_closure, params.loop_closures_sub_maps_radius)?;
            loop_closure.with_transform(refined)
        } else {
            loop_closure.clone()
        };

        info!("Creating loop closure factor");
        let track_a = self.track(loop_closure.track_id_a)?;
        let track_b = self.track(loop_closure.track_id_b)?;
        let key_a = track_a.read().pose_expression_at(loop_closure.time_a_ns);
        let key_b = track_b.read().pose_expression_at(loop_closure.time_b_ns);
        let (Some(key_a), Some(key_b)) = (key_a, key_b) else {
            return Err(EstimatorError::InvariantViolation(
                "loop closure references an empty track".to_string(),
            ));
        };

        let mut new_factors = FactorGraph::new();
        new_factors.push(Factor::relative(
            key_a,
            key_b,
            loop_closure.t_a_b,
            self.loop_closure_noise.clone(),
        ));

        info!("Estimating the trajectories");
        let result = self.estimate_and_remove_locked(new_factors, Values::new())?;

        info!("Updating the trajectories after loop closure");
        self.push_estimate(&result);
        Ok(result)
    }

    fn process_pose_and_scan_locked(
        &mut self,
        worker_id: usize,
        time_ns: Time,
        odometry: SE3,
        scan: PointCloud,
    ) -> Result<Values> {
        let track = self.track(worker_id)?;
        let (new_factors, new_values, is_first) = {
            let mut track = track.write();
            let is_first = track.is_empty();
            let (factors, values) = track.process_pose_and_scan(time_ns, odometry, scan)?;
            (factors, values, is_first)
        };

        let submitted = if is_first {
            self.register_prior_locked(new_factors, new_values, worker_id)
        } else {
            self.estimate_locked(new_factors, new_values)
        };
        let result = match submitted {
            Ok(result) => result,
            Err(e) => {
                track.write().remove_pose(time_ns);
                return Err(e);
            }
        };

        self.push_estimate(&result);
        Ok(result)
    }

    fn estimate_locked(&mut self, new_factors: FactorGraph, new_values: Values) -> Result<Values> {
        let start = Instant::now();

        let update = self.backend.update(new_factors, new_values, &[])?;
        log_update(&update);
        let result = self.settle()?;

        info!(
            "Took {:.3} ms to estimate the trajectory",
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(result)
    }

    fn estimate_and_remove_locked(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
    ) -> Result<Values> {
        let start = Instant::now();

        let to_remove: Vec<FactorIndex> = match self.replaceable_prior {
            Some(index) => vec![index],
            None => {
                warn!("No replaceable prior registered yet, nothing is removed");
                Vec::new()
            }
        };
        let update = self.backend.update(new_factors, new_values, &to_remove)?;
        log_update(&update);
        let result = self.settle()?;

        info!(
            "Took {:.3} ms to estimate the trajectory",
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(result)
    }

    fn register_prior_locked(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
        worker_id: usize,
    ) -> Result<Values> {
        if new_factors.len() != 1 {
            return Err(EstimatorError::InvariantViolation(format!(
                "register_prior expects exactly one factor, got {}",
                new_factors.len()
            )));
        }

        let update = self.backend.update(new_factors, new_values, &[])?;
        log_update(&update);
        let [index] = *update.new_factor_indices.as_slice() else {
            return Err(EstimatorError::InvariantViolation(format!(
                "optimizer assigned {} indices to a single prior",
                update.new_factor_indices.len()
            )));
        };

        if worker_id == ANCHOR_WORKER_ID {
            debug!("Worker {} prior registered as replaceable at index {}", worker_id, index);
            self.replaceable_prior = Some(index);
        }

        self.settle()
    }

    /// Run the settling updates and read back the estimate.
    fn settle(&mut self) -> Result<Values> {
        for _ in 0..SETTLING_UPDATES {
            self.backend
                .update(FactorGraph::new(), Values::new(), &[])?;
        }
        Ok(self.backend.calculate_estimate())
    }

    fn track(&self, id: TrackId) -> Result<SharedLaserTrack> {
        self.laser_tracks.get(id).cloned().ok_or_else(|| {
            EstimatorError::InvariantViolation(format!(
                "track id {} out of range, {} tracks exist",
                id,
                self.laser_tracks.len()
            ))
        })
    }

    fn validate_loop_closure(&self, lc: &RelativePose) -> Result<()> {
        if lc.time_a_ns >= lc.time_b_ns {
            return Err(EstimatorError::InvariantViolation(format!(
                "loop closure has invalid time: time_a {} is not before time_b {}",
                lc.time_a_ns, lc.time_b_ns
            )));
        }

        for (track_id, time_ns) in [(lc.track_id_a, lc.time_a_ns), (lc.track_id_b, lc.time_b_ns)] {
            let track = self.track(track_id)?;
            let track = track.read();
            let (Some(min), Some(max)) = (track.min_time(), track.max_time()) else {
                return Err(EstimatorError::InvariantViolation(format!(
                    "loop closure references empty track {}",
                    track_id
                )));
            };
            if time_ns < min || time_ns > max {
                return Err(EstimatorError::InvariantViolation(format!(
                    "loop closure has invalid time: {} outside [{}, {}] of track {}",
                    time_ns, min, max, track_id
                )));
            }
        }
        Ok(())
    }

    /// Align the sub-map of track b onto the sub-map of track a, starting from
    /// the candidate's transform.
    fn refine_loop_closure(&self, lc: &RelativePose, radius: usize) -> Result<SE3> {
        info!("Creating the sub-maps for loop closure ICP");
        let start = Instant::now();
        let sub_map_a = self
            .track(lc.track_id_a)?
            .read()
            .build_sub_map_around_time(lc.time_a_ns, radius);
        let sub_map_b = self
            .track(lc.track_id_b)?
            .read()
            .build_sub_map_around_time(lc.time_b_ns, radius);
        info!(
            "Took {:.3} ms to create loop closure sub-maps ({} and {} points)",
            start.elapsed().as_secs_f64() * 1e3,
            sub_map_a.len(),
            sub_map_b.len()
        );

        let start = Instant::now();
        let refined = self
            .scan_matcher
            .align(&sub_map_b, &sub_map_a, &lc.t_a_b)?;
        info!(
            "Took {:.3} ms to compute the ICP solution for the loop closure",
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(refined)
    }

    fn push_estimate(&self, values: &Values) {
        for track in &self.laser_tracks {
            let mut track = track.write();
            let updated = track.update_from_values(values);
            debug!("Track {}: {} poses updated", track.id(), updated);
        }
    }
}

fn load_icp_config(path: &Path) -> IcpConfig {
    match IcpConfig::load(path) {
        Ok(config) => {
            info!("Loaded ICP configuration from {:?}", path);
            config
        }
        Err(e) => {
            warn!("Could not load ICP configuration ({}), using defaults", e);
            IcpConfig::default()
        }
    }
}

fn log_update(update: &UpdateResult) {
    debug!(
        "Optimizer update: {} new factors, {} removed, {} relinearized, error {:.6} -> {:.6}",
        update.new_factor_indices.len(),
        update.removed_factors,
        update.relinearized_variables,
        update.error_before,
        update.error_after
    );
}
