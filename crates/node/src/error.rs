//! Error types for the node and its services

use std::time::Duration;

use dse_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by node, subscription and RPC operations
#[derive(Debug, Error)]
pub enum DseError {
    /// A service or method name is already taken
    #[error("name '{0}' is already registered")]
    DuplicateName(String),

    /// The named service or method is not registered anywhere reachable
    #[error("{0} not found")]
    NotFound(String),

    /// No response arrived before the deadline
    #[error("call to {target} timed out after {after:?}")]
    Timeout {
        /// Service and method that were called
        target: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Transport-level failure
    #[error("channel error: {0}")]
    Channel(#[from] TransportError),

    /// The node has been stopped
    #[error("node is stopped")]
    Closed,

    /// The remote method raised an error
    #[error("remote error: {0}")]
    Remote(String),

    /// A protocol message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A data source driver failed to poll its external system
    #[error("driver error: {0}")]
    Driver(String),
}

/// Result type for node operations
pub type DseResult<T> = Result<T, DseError>;
