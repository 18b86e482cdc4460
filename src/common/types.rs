//! Core identifier and data types shared by tracks, the optimizer and the estimator.

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Timestamp in nanoseconds.
pub type Time = u64;

/// Index of a laser track. One track exists per SLAM worker.
pub type TrackId = usize;

/// Symbolic identifier of a pose variable: the pose of `track_id` at `time_ns`.
///
/// Keys are lightweight handles; building a factor from a key does not
/// evaluate the pose, the optimizer looks it up when linearizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoseKey {
    pub track_id: TrackId,
    pub time_ns: Time,
}

impl PoseKey {
    pub fn new(track_id: TrackId, time_ns: Time) -> Self {
        Self { track_id, time_ns }
    }
}

impl std::fmt::Display for PoseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}@{}", self.track_id, self.time_ns)
    }
}

/// A 3D point cloud.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Return a copy of this cloud with every point mapped through `transform`.
    pub fn transformed(&self, transform: &SE3) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| transform.transform_point(p))
                .collect(),
        }
    }

    /// Append all points of `other`.
    pub fn extend(&mut self, other: &PointCloud) {
        self.points.extend_from_slice(&other.points);
    }
}

/// A relative pose measurement between two tracks (a loop-closure candidate).
///
/// `t_a_b` maps points expressed in the frame of the pose of `track_id_b` at
/// `time_b_ns` into the frame of the pose of `track_id_a` at `time_a_ns`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePose {
    pub track_id_a: TrackId,
    pub track_id_b: TrackId,
    pub time_a_ns: Time,
    pub time_b_ns: Time,
    pub t_a_b: SE3,
}

impl RelativePose {
    /// Copy of this candidate with a refined transform.
    pub fn with_transform(&self, t_a_b: SE3) -> Self {
        Self {
            t_a_b,
            ..self.clone()
        }
    }
}
