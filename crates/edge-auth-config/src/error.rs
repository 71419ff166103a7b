//! Error types.

use thiserror::Error;

/// Configuration result type.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while reading or validating edge configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON/TOML or has the wrong shape.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// The configuration parsed but violates a constraint.
    #[error("configuration validation error: {0}")]
    Validation(String),
}
