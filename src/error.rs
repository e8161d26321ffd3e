//! Error types for ratewarden.

use thiserror::Error;

/// Main error type for ratewarden operations.
///
/// Rate-limit and blacklist rejections are not errors; they are reported as
/// [`crate::admission::Decision`] values.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source could not be read or deserialized
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Transport or command failure talking to the shared store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
