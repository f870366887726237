//! Error types for the reaper engine

use std::time::Duration;

/// Errors returned by a container runtime call
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Docker API error
    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// The call did not complete within its deadline
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// General error
    #[error("{0}")]
    Other(String),
}

/// Errors that are fatal to the process or to a whole cycle
#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    /// Invalid policy configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Client construction or ping failure
    #[error("failed to connect to container runtime: {0}")]
    Connection(#[source] RuntimeError),

    /// Listing running containers failed
    #[error("failed to list running containers: {0}")]
    Enumeration(#[source] RuntimeError),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ReaperError>;
