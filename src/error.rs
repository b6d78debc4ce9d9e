//! Error types for GatiSLAM

use thiserror::Error;

/// GatiSLAM error type
#[derive(Error, Debug)]
pub enum GatiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Solver error: {0}")]
    Solver(String),

    #[error("Artifact error: {0}")]
    Artifact(String),
}

impl From<toml::de::Error> for GatiError {
    fn from(e: toml::de::Error) -> Self {
        GatiError::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for GatiError {
    fn from(e: serde_yaml::Error) -> Self {
        GatiError::Artifact(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatiError>;
