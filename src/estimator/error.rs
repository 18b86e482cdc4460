use thiserror::Error;

use crate::matching::MatchError;
use crate::optimizer::OptimizerError;
use crate::track::TrackError;

/// Errors returned by [`IncrementalEstimator`](super::IncrementalEstimator)
/// operations.
///
/// Every variant is fatal for the call that produced it. Validation failures
/// are reported before the optimizer is touched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimatorError {
    /// Malformed loop closure, out-of-range track id, or an unexpected
    /// factor count reported by the optimizer.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("loop closure refinement failed: {0}")]
    ScanMatching(#[from] MatchError),

    #[error("optimizer update failed: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("laser track rejected the pose: {0}")]
    Track(#[from] TrackError),
}

pub type Result<T> = std::result::Result<T, EstimatorError>;
