//! Error types for the policy daemon.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout the daemon.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors surfaced by policy store operations and the admin interface.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A key or DSCP token failed to parse.
    #[error(transparent)]
    Parse(#[from] dscp_types::ParseError),

    /// A DNS rule pattern failed to compile.
    #[error("invalid DNS pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// An admin request carried a missing or malformed field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A policy file could not be opened.
    #[error("failed to open policy file '{}'", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The daemon task is gone; no further requests can be served.
    #[error("daemon is shutting down")]
    Shutdown,
}

impl PolicyError {
    pub fn invalid_pattern(pattern: &str, err: &regex::Error) -> Self {
        PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        PolicyError::InvalidArgument(msg.into())
    }
}
