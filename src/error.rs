//! Error types for the keyed limiter.

use thiserror::Error;

/// Main error type for limiter construction and configuration.
///
/// Admission checks never fail; every variant here is raised while building
/// a limiter or loading its configuration.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tokio runtime was available to host decay processes
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
