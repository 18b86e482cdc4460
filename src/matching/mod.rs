//! Rigid point-cloud alignment used to refine loop closures.
//!
//! The estimator only needs [`ScanMatcher::align`]; [`IcpMatcher`] is the
//! point-to-point ICP implementation configured from YAML.

pub mod icp;

use thiserror::Error;

use crate::common::PointCloud;
use crate::geometry::SE3;

pub use icp::{IcpConfig, IcpMatcher};

/// Reasons a rigid alignment can fail.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatchError {
    #[error("cannot align an empty point cloud (source: {source_len}, target: {target_len})")]
    EmptyCloud {
        source_len: usize,
        target_len: usize,
    },

    #[error("only {found} correspondences within range, {required} required")]
    TooFewCorrespondences { found: usize, required: usize },

    #[error("degenerate correspondence set, rotation is unobservable")]
    Degenerate,
}

/// Rigid alignment of two point clouds.
pub trait ScanMatcher: Send {
    /// Find the transform `T` such that `T * source ≈ target`, starting from
    /// `initial_guess`.
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        initial_guess: &SE3,
    ) -> Result<SE3, MatchError>;
}
