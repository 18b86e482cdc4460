//! Estimator and laser track parameters.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::optimizer::{NoiseModel, SmootherParams};

use super::{load_yaml, ConfigError};

/// Parameters of a single laser track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserTrackParams {
    /// ICP configuration used when refining loop closures.
    pub icp_configuration_file: PathBuf,

    /// Odometry factor standard deviations `[rx, ry, rz, tx, ty, tz]`.
    pub odometry_noise_model: [f64; 6],

    /// Standard deviations of the prior placed on the first pose of a track.
    pub prior_noise_model: [f64; 6],
}

impl Default for LaserTrackParams {
    fn default() -> Self {
        Self {
            icp_configuration_file: PathBuf::from("config/icp.yaml"),
            odometry_noise_model: [0.01, 0.01, 0.01, 0.05, 0.05, 0.05],
            prior_noise_model: [1e-4, 1e-4, 1e-4, 1e-3, 1e-3, 1e-3],
        }
    }
}

impl LaserTrackParams {
    pub fn odometry_noise(&self) -> NoiseModel {
        NoiseModel::diagonal(self.odometry_noise_model)
    }

    pub fn prior_noise(&self) -> NoiseModel {
        NoiseModel::diagonal(self.prior_noise_model)
    }
}

/// Parameters of the incremental estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorParams {
    /// Relinearize every this many optimizer updates.
    pub relinearize_skip: usize,

    /// Delta magnitude above which a variable is relinearized.
    pub relinearize_threshold: f64,

    /// Loop-closure standard deviations `[rx, ry, rz, tx, ty, tz]`.
    pub loop_closure_noise_model: [f64; 6],

    /// Wrap the loop-closure noise model with a Cauchy M-estimator.
    pub add_m_estimator_on_loop_closures: bool,

    /// Refine loop-closure transforms with ICP on local sub-maps.
    pub do_icp_step_on_loop_closures: bool,

    /// Number of neighbouring scans on each side of the loop-closure pose
    /// aggregated into a refinement sub-map.
    pub loop_closures_sub_maps_radius: usize,

    pub laser_track: LaserTrackParams,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            relinearize_skip: 1,
            relinearize_threshold: 0.001,
            loop_closure_noise_model: [0.01, 0.01, 0.01, 0.05, 0.05, 0.05],
            add_m_estimator_on_loop_closures: false,
            do_icp_step_on_loop_closures: false,
            loop_closures_sub_maps_radius: 3,
            laser_track: LaserTrackParams::default(),
        }
    }
}

impl EstimatorParams {
    /// Load and validate parameters from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let params: Self = load_yaml(path)?;
        params.validate()?;
        Ok(params)
    }

    /// Parse and validate parameters from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        params.validate()?;
        Ok(params)
    }

    /// Check that every noise model is well defined.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let noise_models = [
            ("loop_closure_noise_model", &self.loop_closure_noise_model),
            (
                "laser_track.odometry_noise_model",
                &self.laser_track.odometry_noise_model,
            ),
            (
                "laser_track.prior_noise_model",
                &self.laser_track.prior_noise_model,
            ),
        ];
        for (name, sigmas) in noise_models {
            if sigmas.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "{} must contain six positive sigmas, got {:?}",
                    name, sigmas
                )));
            }
        }
        if !(self.relinearize_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "relinearize_threshold must be non-negative, got {}",
                self.relinearize_threshold
            )));
        }
        Ok(())
    }

    pub fn smoother_params(&self) -> SmootherParams {
        SmootherParams {
            relinearize_skip: self.relinearize_skip,
            relinearize_threshold: self.relinearize_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let params = EstimatorParams::default();
        assert_eq!(params.relinearize_skip, 1);
        assert!(!params.do_icp_step_on_loop_closures);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
add_m_estimator_on_loop_closures: true
loop_closures_sub_maps_radius: 5
laser_track:
  icp_configuration_file: /tmp/icp.yaml
"#;
        let params = EstimatorParams::from_yaml(yaml).unwrap();

        assert!(params.add_m_estimator_on_loop_closures);
        assert_eq!(params.loop_closures_sub_maps_radius, 5);
        assert_eq!(
            params.laser_track.icp_configuration_file,
            PathBuf::from("/tmp/icp.yaml")
        );
        assert_eq!(params.relinearize_threshold, 0.001);
        assert_eq!(
            params.laser_track.prior_noise_model,
            LaserTrackParams::default().prior_noise_model
        );
    }

    #[test]
    fn test_rejects_non_positive_sigma() {
        let yaml = "loop_closure_noise_model: [0.1, 0.1, 0.0, 0.1, 0.1, 0.1]\n";
        let err = EstimatorParams::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "relinearize_skip: 3").unwrap();
        writeln!(file, "do_icp_step_on_loop_closures: true").unwrap();

        let params = EstimatorParams::load(file.path()).unwrap();

        assert_eq!(params.relinearize_skip, 3);
        assert!(params.do_icp_step_on_loop_closures);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EstimatorParams::load("/nonexistent/estimator.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
