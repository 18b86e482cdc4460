//! The shared pose-graph estimator and its error type.

mod error;
mod incremental_estimator;

pub use error::{EstimatorError, Result};
pub use incremental_estimator::{IncrementalEstimator, ANCHOR_WORKER_ID};
