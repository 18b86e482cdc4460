//! Incremental pose-graph optimization.
//!
//! The estimator talks to the optimizer only through [`OptimizerBackend`]:
//! add factors and variables, remove previously added factors by the index
//! they were assigned, and read back the current best estimate.
//! [`IncrementalSmoother`] is the in-crate implementation.

pub mod factors;
pub mod incremental_smoother;
pub mod noise;
pub mod values;

use thiserror::Error;

use crate::common::PoseKey;

pub use factors::{Factor, FactorGraph};
pub use incremental_smoother::{IncrementalSmoother, SmootherParams};
pub use noise::{NoiseModel, RobustKernel};
pub use values::Values;

/// Stable index assigned to a factor when it is added to the optimizer.
pub type FactorIndex = usize;

/// Outcome of a single optimizer update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    /// Indices assigned to the newly added factors, in submission order.
    pub new_factor_indices: Vec<FactorIndex>,

    /// Number of factors actually removed by this update.
    pub removed_factors: usize,

    /// Number of variables added by this update.
    pub new_variables: usize,

    /// Number of variables whose linearization point moved.
    pub relinearized_variables: usize,

    /// Total cost at the linearization point before solving.
    pub error_before: f64,

    /// Total cost at the new estimate.
    pub error_after: f64,
}

/// Errors reported by an optimizer backend. Updates that fail leave the
/// backend unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("factor index {0} was never assigned")]
    UnknownFactor(FactorIndex),

    #[error("variable {0} already exists")]
    DuplicateVariable(PoseKey),

    #[error("factor references unknown variable {0}")]
    MissingVariable(PoseKey),
}

/// Incremental global estimator over a growing and shrinking factor set.
pub trait OptimizerBackend: Send {
    /// Add `new_factors` and `new_values`, removing the factors at
    /// `remove_factor_indices` first.
    fn update(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
        remove_factor_indices: &[FactorIndex],
    ) -> Result<UpdateResult, OptimizerError>;

    /// Current best estimate of every variable.
    fn calculate_estimate(&self) -> Values;

    /// Number of active (added and not removed) factors.
    fn num_factors(&self) -> usize;
}
