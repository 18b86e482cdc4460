//! Noise models for pose factors.
//!
//! A factor's raw 6-DOF residual is whitened by the per-axis standard
//! deviations. A robust model additionally down-weights the whitened residual
//! with an M-estimator (iteratively reweighted least squares), which limits the
//! influence of wrong loop closures.

use nalgebra::{DMatrix, Vector6};

/// M-estimator used to wrap a diagonal noise model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustKernel {
    /// Cauchy (Lorentzian) kernel.
    ///
    /// Loss: `ρ(r) = (k²/2) * log(1 + (r/k)²)`
    /// Weight: `1 / (1 + (r/k)²)`
    Cauchy { k: f64 },
}

impl RobustKernel {
    /// IRLS weight for a whitened residual norm.
    pub fn weight(&self, residual_norm: f64) -> f64 {
        match *self {
            RobustKernel::Cauchy { k } => {
                let ratio = residual_norm / k;
                1.0 / (1.0 + ratio * ratio)
            }
        }
    }

    /// Robust loss for a whitened residual norm.
    pub fn loss(&self, residual_norm: f64) -> f64 {
        match *self {
            RobustKernel::Cauchy { k } => {
                let ratio = residual_norm / k;
                0.5 * k * k * (1.0 + ratio * ratio).ln()
            }
        }
    }
}

/// Noise model attached to every factor.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel {
    /// Diagonal covariance given by standard deviations
    /// `[rx, ry, rz, tx, ty, tz]`.
    Diagonal { sigmas: Vector6<f64> },

    /// Diagonal covariance wrapped by a robust kernel.
    Robust {
        kernel: RobustKernel,
        sigmas: Vector6<f64>,
    },
}

impl NoiseModel {
    /// Plain diagonal model. Sigmas must be strictly positive.
    pub fn diagonal(sigmas: [f64; 6]) -> Self {
        NoiseModel::Diagonal {
            sigmas: Vector6::from_row_slice(&sigmas),
        }
    }

    /// Diagonal model wrapped with a Cauchy kernel of parameter `k`.
    pub fn robust_cauchy(k: f64, sigmas: [f64; 6]) -> Self {
        NoiseModel::Robust {
            kernel: RobustKernel::Cauchy { k },
            sigmas: Vector6::from_row_slice(&sigmas),
        }
    }

    pub fn is_robust(&self) -> bool {
        matches!(self, NoiseModel::Robust { .. })
    }

    pub fn sigmas(&self) -> &Vector6<f64> {
        match self {
            NoiseModel::Diagonal { sigmas } | NoiseModel::Robust { sigmas, .. } => sigmas,
        }
    }

    /// Divide each residual component by its standard deviation.
    pub fn whiten(&self, residual: &Vector6<f64>) -> Vector6<f64> {
        residual.component_div(self.sigmas())
    }

    /// Whitened (and robustly reweighted) residual and Jacobian, in place.
    ///
    /// `jacobian` has one row per residual component.
    pub fn whiten_system(&self, residual: &mut Vector6<f64>, jacobian: &mut DMatrix<f64>) {
        let sigmas = *self.sigmas();
        for row in 0..6 {
            residual[row] /= sigmas[row];
            jacobian.row_mut(row).scale_mut(1.0 / sigmas[row]);
        }

        if let NoiseModel::Robust { kernel, .. } = self {
            let sqrt_weight = kernel.weight(residual.norm()).sqrt();
            *residual *= sqrt_weight;
            jacobian.scale_mut(sqrt_weight);
        }
    }

    /// Cost contribution of a raw residual.
    pub fn error(&self, residual: &Vector6<f64>) -> f64 {
        let whitened = self.whiten(residual);
        match self {
            NoiseModel::Diagonal { .. } => 0.5 * whitened.norm_squared(),
            NoiseModel::Robust { kernel, .. } => kernel.loss(whitened.norm()),
        }
    }
}
