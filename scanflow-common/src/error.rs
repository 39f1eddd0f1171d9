//! Common error types for scanflow

use thiserror::Error;

/// Common result type for scanflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration and resolving paths
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or type error in the configuration file
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested file not found
    #[error("Not found: {0}")]
    NotFound(String),
}
