//! YAML configuration for the estimator, the laser tracks and ICP.
//!
//! Every section is `#[serde(default)]`, so a file only needs to list the
//! values it overrides.

mod error;
mod params;

use std::fs::File;
use std::path::Path;

use serde::de::DeserializeOwned;

pub use error::ConfigError;
pub use params::{EstimatorParams, LaserTrackParams};

/// Deserialize a YAML file into `T`.
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
