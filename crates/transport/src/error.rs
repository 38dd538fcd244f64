//! Error types for message channel implementations

use thiserror::Error;

use crate::NodeId;

/// Errors raised by a message channel
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport address could not be used
    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    /// A node with the same identity is already attached to the channel
    #[error("node {0} is already attached")]
    AlreadyAttached(NodeId),

    /// The recipient is not reachable on this channel
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    /// The connection has been shut down
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other failure
    #[error("{0}")]
    Other(String),
}
