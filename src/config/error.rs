//! Configuration loading errors.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to load a YAML configuration file.
///
/// These errors are recoverable: callers log them and fall back to defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
