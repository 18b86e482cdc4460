//! Pose-graph factors.
//!
//! Factors reference pose variables symbolically through [`PoseKey`]s and are
//! evaluated by the optimizer against its current linearization point.

use nalgebra::Vector6;

use crate::common::PoseKey;
use crate::geometry::SE3;

use super::noise::NoiseModel;
use super::values::Values;

/// A constraint on one or two pose variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    /// Absolute prior on a single pose: `log(prior^{-1} ∘ x)`.
    Prior {
        key: PoseKey,
        prior: SE3,
        noise: NoiseModel,
    },

    /// Relative pose between two variables: `log(t_a_b^{-1} ∘ (x_a^{-1} ∘ x_b))`.
    ///
    /// Odometry edges and loop closures are both relative factors.
    Relative {
        key_a: PoseKey,
        key_b: PoseKey,
        t_a_b: SE3,
        noise: NoiseModel,
    },
}

impl Factor {
    pub fn prior(key: PoseKey, prior: SE3, noise: NoiseModel) -> Self {
        Factor::Prior { key, prior, noise }
    }

    pub fn relative(key_a: PoseKey, key_b: PoseKey, t_a_b: SE3, noise: NoiseModel) -> Self {
        Factor::Relative {
            key_a,
            key_b,
            t_a_b,
            noise,
        }
    }

    /// Keys of the variables this factor touches, in evaluation order.
    pub fn keys(&self) -> Vec<PoseKey> {
        match self {
            Factor::Prior { key, .. } => vec![*key],
            Factor::Relative { key_a, key_b, .. } => vec![*key_a, *key_b],
        }
    }

    pub fn noise(&self) -> &NoiseModel {
        match self {
            Factor::Prior { noise, .. } | Factor::Relative { noise, .. } => noise,
        }
    }

    /// Raw residual given the poses of `keys()`, in the same order.
    pub fn residual(&self, poses: &[SE3]) -> Vector6<f64> {
        match self {
            Factor::Prior { prior, .. } => prior.between(&poses[0]).log(),
            Factor::Relative { t_a_b, .. } => {
                let predicted = poses[0].between(&poses[1]);
                t_a_b.between(&predicted).log()
            }
        }
    }

    /// Raw residual evaluated at `values`, `None` if a variable is missing.
    pub fn unwhitened_error(&self, values: &Values) -> Option<Vector6<f64>> {
        let poses = self
            .keys()
            .iter()
            .map(|k| values.get(k).copied())
            .collect::<Option<Vec<_>>>()?;
        Some(self.residual(&poses))
    }

    /// Cost of this factor at `values` (0 if a variable is missing).
    pub fn error(&self, values: &Values) -> f64 {
        self.unwhitened_error(values)
            .map(|r| self.noise().error(&r))
            .unwrap_or(0.0)
    }
}

/// An ordered batch of factors submitted to the optimizer together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorGraph {
    factors: Vec<Factor>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self {
            factors: Vec::new(),
        }
    }

    pub fn push(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Factor> {
        self.factors.iter()
    }

    /// Append all factors of `other`.
    pub fn extend(&mut self, other: FactorGraph) {
        self.factors.extend(other.factors);
    }
}

impl From<Vec<Factor>> for FactorGraph {
    fn from(factors: Vec<Factor>) -> Self {
        Self { factors }
    }
}

impl IntoIterator for FactorGraph {
    type Item = Factor;
    type IntoIter = std::vec::IntoIter<Factor>;

    fn into_iter(self) -> Self::IntoIter {
        self.factors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn unit_noise() -> NoiseModel {
        NoiseModel::diagonal([1.0; 6])
    }

    #[test]
    fn test_prior_residual_zero_at_prior() {
        let pose = SE3::from_yaw_translation(0.4, Vector3::new(1.0, 2.0, 0.0));
        let factor = Factor::prior(PoseKey::new(0, 0), pose, unit_noise());

        assert_relative_eq!(factor.residual(&[pose]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_relative_residual() {
        let x_a = SE3::from_translation(1.0, 0.0, 0.0);
        let x_b = SE3::from_translation(3.0, 0.0, 0.0);
        let measured = SE3::from_translation(2.5, 0.0, 0.0);
        let factor = Factor::relative(PoseKey::new(0, 0), PoseKey::new(1, 0), measured, unit_noise());

        let r = factor.residual(&[x_a, x_b]);

        assert_relative_eq!(r[3], -0.5, epsilon = 1e-12);
        assert_relative_eq!(r.rows(0, 3).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unwhitened_error_missing_variable() {
        let factor = Factor::relative(
            PoseKey::new(0, 0),
            PoseKey::new(0, 1),
            SE3::identity(),
            unit_noise(),
        );
        let mut values = Values::new();
        values.insert(PoseKey::new(0, 0), SE3::identity());

        assert!(factor.unwhitened_error(&values).is_none());
        assert_eq!(factor.error(&values), 0.0);
    }

    #[test]
    fn test_keys_order() {
        let factor = Factor::relative(
            PoseKey::new(1, 50),
            PoseKey::new(0, 10),
            SE3::identity(),
            unit_noise(),
        );
        assert_eq!(factor.keys(), vec![PoseKey::new(1, 50), PoseKey::new(0, 10)]);
    }
}
