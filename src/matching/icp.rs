//! Point-to-Point Iterative Closest Point in 3D.
//!
//! ```text
//! Input: source S, target T, initial guess T₀
//! 1. S' = T₀ * S
//! 2. repeat:
//!    a. nearest neighbour in T for each point of S' (k-d tree)
//!    b. drop pairs beyond the correspondence distance and the worst
//!       `outlier_ratio` fraction
//!    c. closed-form rigid step ΔT from the pairs (SVD)
//!    d. T ← ΔT ∘ T, stop when ΔT is below the epsilons
//! ```

use std::path::Path;

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::PointCloud;
use crate::config::{load_yaml, ConfigError};
use crate::geometry::SE3;

use super::{MatchError, ScanMatcher};

/// ICP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Maximum number of iterations.
    pub max_iterations: usize,

    /// Point pairs farther apart than this (meters) are rejected.
    pub max_correspondence_distance: f64,

    /// Minimum number of valid correspondences per iteration.
    pub min_correspondences: usize,

    /// Fraction of the worst correspondences rejected each iteration.
    pub outlier_ratio: f64,

    /// Convergence threshold on the translation step (meters).
    pub translation_epsilon: f64,

    /// Convergence threshold on the rotation step (radians).
    pub rotation_epsilon: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_correspondence_distance: 1.0,
            min_correspondences: 10,
            outlier_ratio: 0.1,
            translation_epsilon: 1e-5,
            rotation_epsilon: 1e-5,
        }
    }
}

impl IcpConfig {
    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path)?;
        if !(0.0..1.0).contains(&config.outlier_ratio) {
            return Err(ConfigError::Invalid(format!(
                "outlier_ratio must be in [0, 1), got {}",
                config.outlier_ratio
            )));
        }
        Ok(config)
    }
}

/// Point-to-point ICP matcher.
#[derive(Debug, Clone, Default)]
pub struct IcpMatcher {
    config: IcpConfig,
}

impl IcpMatcher {
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    fn build_kdtree(cloud: &PointCloud) -> KdTree<f64, 3> {
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, p) in cloud.points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        tree
    }

    /// Returns (source_idx, target_idx, squared_distance) triples.
    fn find_correspondences(
        &self,
        source: &PointCloud,
        target_tree: &KdTree<f64, 3>,
        transform: &SE3,
    ) -> Vec<(usize, usize, f64)> {
        let max_dist_sq = self.config.max_correspondence_distance.powi(2);
        let mut correspondences = Vec::with_capacity(source.len());

        for (i, p) in source.points.iter().enumerate() {
            let q = transform.transform_point(p);
            let nearest = target_tree.nearest_one::<SquaredEuclidean>(&[q.x, q.y, q.z]);
            if nearest.distance <= max_dist_sq {
                correspondences.push((i, nearest.item as usize, nearest.distance));
            }
        }

        if self.config.outlier_ratio > 0.0 && !correspondences.is_empty() {
            correspondences.sort_by(|a, b| a.2.total_cmp(&b.2));
            let keep =
                ((1.0 - self.config.outlier_ratio) * correspondences.len() as f64) as usize;
            correspondences.truncate(keep.max(self.config.min_correspondences));
        }

        correspondences
    }

    /// Closed-form rigid transform mapping `from[i]` onto `to[i]` (Horn/Umeyama, fixed scale).
    fn compute_rigid_step(
        from: &[Vector3<f64>],
        to: &[Vector3<f64>],
    ) -> Result<SE3, MatchError> {
        let n = from.len() as f64;
        let centroid_from: Vector3<f64> = from.iter().sum::<Vector3<f64>>() / n;
        let centroid_to: Vector3<f64> = to.iter().sum::<Vector3<f64>>() / n;

        let mut h = Matrix3::zeros();
        for (p, q) in from.iter().zip(to) {
            h += (p - centroid_from) * (q - centroid_to).transpose();
        }

        let svd = h.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(MatchError::Degenerate);
        };

        let mut rotation_mat = v_t.transpose() * u.transpose();
        if rotation_mat.determinant() < 0.0 {
            let mut v = v_t.transpose();
            for i in 0..3 {
                v[(i, 2)] = -v[(i, 2)];
            }
            rotation_mat = v * u.transpose();
        }

        if !rotation_mat.iter().all(|x| x.is_finite()) {
            return Err(MatchError::Degenerate);
        }

        let rotation =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
        let translation = centroid_to - rotation * centroid_from;

        Ok(SE3 {
            rotation,
            translation,
        })
    }
}

impl ScanMatcher for IcpMatcher {
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        initial_guess: &SE3,
    ) -> Result<SE3, MatchError> {
        if source.is_empty() || target.is_empty() {
            return Err(MatchError::EmptyCloud {
                source_len: source.len(),
                target_len: target.len(),
            });
        }

        let required = self.config.min_correspondences.max(3);
        let target_tree = Self::build_kdtree(target);
        let mut transform = *initial_guess;

        for iteration in 0..self.config.max_iterations {
            let correspondences = self.find_correspondences(source, &target_tree, &transform);
            if correspondences.len() < required {
                return Err(MatchError::TooFewCorrespondences {
                    found: correspondences.len(),
                    required,
                });
            }

            let from: Vec<Vector3<f64>> = correspondences
                .iter()
                .map(|&(si, _, _)| transform.transform_point(&source.points[si]))
                .collect();
            let to: Vec<Vector3<f64>> = correspondences
                .iter()
                .map(|&(_, ti, _)| target.points[ti])
                .collect();

            let step = Self::compute_rigid_step(&from, &to)?;
            transform = step.compose(&transform);

            if step.translation.norm() < self.config.translation_epsilon
                && step.angle() < self.config.rotation_epsilon
            {
                debug!("ICP converged after {} iterations", iteration + 1);
                return Ok(transform);
            }
        }

        debug!(
            "ICP reached the iteration limit ({})",
            self.config.max_iterations
        );
        Ok(transform)
    }
}
