//! Per-worker trajectory: ordered poses with their scans.
//!
//! A track is the push-back sink of the estimator. New poses are appended
//! through [`LaserTrack::process_pose_and_scan`] and stored pose values are
//! overwritten through [`LaserTrack::update_from_values`], both driven by the
//! estimator while it holds its lock.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::common::{PointCloud, PoseKey, Time, TrackId};
use crate::config::LaserTrackParams;
use crate::geometry::SE3;
use crate::optimizer::{Factor, FactorGraph, Values};

/// Handle to a track shared between its worker and the estimator.
pub type SharedLaserTrack = Arc<RwLock<LaserTrack>>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackError {
    #[error("track {track_id}: pose at {time_ns} ns is not after the last pose at {last_ns} ns")]
    NonIncreasingTime {
        track_id: TrackId,
        time_ns: Time,
        last_ns: Time,
    },
}

/// A single pose of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPose {
    pub time_ns: Time,

    /// Current estimate of the sensor pose in the world frame (T_w_s).
    pub t_w: SE3,

    /// Raw odometry pose as received.
    pub odometry: SE3,

    /// Scan in the sensor frame.
    pub scan: PointCloud,
}

#[derive(Debug)]
pub struct LaserTrack {
    id: TrackId,
    params: LaserTrackParams,
    poses: BTreeMap<Time, TrackPose>,
}

impl LaserTrack {
    pub fn new(params: LaserTrackParams, id: TrackId) -> Self {
        Self {
            id,
            params,
            poses: BTreeMap::new(),
        }
    }

    /// Wrap a new empty track in a shared handle.
    pub fn shared(params: LaserTrackParams, id: TrackId) -> SharedLaserTrack {
        Arc::new(RwLock::new(Self::new(params, id)))
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn min_time(&self) -> Option<Time> {
        self.poses.keys().next().copied()
    }

    pub fn max_time(&self) -> Option<Time> {
        self.poses.keys().next_back().copied()
    }

    pub fn pose_at(&self, time_ns: Time) -> Option<&TrackPose> {
        self.poses.get(&time_ns)
    }

    pub fn poses(&self) -> impl Iterator<Item = &TrackPose> {
        self.poses.values()
    }

    /// Append a pose with its scan and return the factors and initial values
    /// it contributes to the pose graph.
    ///
    /// The first pose of a track is anchored by a prior at its odometry pose.
    /// Every later pose gets an odometry factor to its predecessor, and its
    /// initial estimate is the predecessor's estimate moved by the odometry
    /// increment.
    pub fn process_pose_and_scan(
        &mut self,
        time_ns: Time,
        odometry: SE3,
        scan: PointCloud,
    ) -> Result<(FactorGraph, Values), TrackError> {
        let mut factors = FactorGraph::new();
        let mut values = Values::new();
        let key = PoseKey::new(self.id, time_ns);

        let t_w = match self.poses.values().next_back() {
            None => {
                factors.push(Factor::prior(key, odometry, self.params.prior_noise()));
                odometry
            }
            Some(last) if time_ns <= last.time_ns => {
                return Err(TrackError::NonIncreasingTime {
                    track_id: self.id,
                    time_ns,
                    last_ns: last.time_ns,
                });
            }
            Some(last) => {
                let increment = last.odometry.between(&odometry);
                factors.push(Factor::relative(
                    PoseKey::new(self.id, last.time_ns),
                    key,
                    increment,
                    self.params.odometry_noise(),
                ));
                last.t_w.compose(&increment)
            }
        };

        values.insert(key, t_w);
        self.poses.insert(
            time_ns,
            TrackPose {
                time_ns,
                t_w,
                odometry,
                scan,
            },
        );

        Ok((factors, values))
    }

    /// Drop the pose stored at `time_ns`.
    pub fn remove_pose(&mut self, time_ns: Time) -> Option<TrackPose> {
        self.poses.remove(&time_ns)
    }

    /// Symbolic handle to the stored pose nearest to `time_ns`.
    ///
    /// Ties resolve to the earlier pose. `None` for an empty track.
    pub fn pose_expression_at(&self, time_ns: Time) -> Option<PoseKey> {
        self.nearest_time(time_ns)
            .map(|t| PoseKey::new(self.id, t))
    }

    fn nearest_time(&self, time_ns: Time) -> Option<Time> {
        let before = self.poses.range(..=time_ns).next_back().map(|(t, _)| *t);
        let after = self.poses.range(time_ns..).next().map(|(t, _)| *t);
        match (before, after) {
            (Some(b), Some(a)) => Some(if time_ns - b <= a - time_ns { b } else { a }),
            (b, a) => b.or(a),
        }
    }

    /// Aggregate the scans of the pose nearest to `time_ns` and of up to
    /// `radius` neighbouring poses on each side.
    ///
    /// Points are expressed in the frame of the centre pose.
    pub fn build_sub_map_around_time(&self, time_ns: Time, radius: usize) -> PointCloud {
        let mut sub_map = PointCloud::new();
        let Some(center_time) = self.nearest_time(time_ns) else {
            return sub_map;
        };
        let Some(center) = self.poses.get(&center_time) else {
            return sub_map;
        };
        let t_center_w = center.t_w.inverse();

        let before = self.poses.range(..center_time).rev().take(radius);
        let after = self
            .poses
            .range((Excluded(center_time), Unbounded))
            .take(radius);

        for (_, pose) in before.chain(std::iter::once((&center_time, center))).chain(after) {
            let t_center_s = t_center_w.compose(&pose.t_w);
            sub_map.extend(&pose.scan.transformed(&t_center_s));
        }

        debug!(
            "Track {}: sub-map around {} ns has {} points",
            self.id,
            center_time,
            sub_map.len()
        );
        sub_map
    }

    /// Overwrite the stored estimates of every pose of this track present in
    /// `values`. Returns the number of poses updated.
    pub fn update_from_values(&mut self, values: &Values) -> usize {
        let mut updated = 0;
        for (key, pose) in values.track_values(self.id) {
            if let Some(stored) = self.poses.get_mut(&key.time_ns) {
                stored.t_w = *pose;
                updated += 1;
            }
        }
        updated
    }
}
