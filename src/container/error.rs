//! Container driver error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// An engine CLI invocation failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// A container with this name already exists.
    #[error("container {0} already exists")]
    AlreadyExists(String),

    /// The container must be running for this operation.
    #[error("container {0} is not running")]
    NotRunning(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
