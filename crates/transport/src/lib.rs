//! Message channel abstraction for the distributed service engine.
//!
//! A channel gives every attached node two delivery modes:
//! - point-to-point envelopes addressed to a single node, optionally carrying
//!   a correlation id so request/response pairs can be matched up
//! - topic broadcast to every other node currently subscribed to the topic
//!
//! Envelopes from one sender to one receiver are delivered in send order, so a
//! publisher's messages on a topic arrive in order at each subscriber. Nothing
//! is promised across distinct senders or topics.
//!
//! Concrete channels live in their own crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod node_id;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use uuid::Uuid;

pub use error::TransportError;
pub use node_id::NodeId;

/// Transport-level message envelope
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// Correlation ID for request/response tracking
    pub correlation_id: Option<Uuid>,
    /// Message type chosen by the sender
    pub message_type: String,
    /// Opaque payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: NodeId,
    /// Topic the envelope was broadcast on, `None` for point-to-point sends
    pub topic: Option<String>,
}

/// Transport trait for sending and receiving messages
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity this transport is attached as
    fn local_id(&self) -> &NodeId;

    /// Send a message to a specific node
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError>;

    /// Broadcast a message to every other node subscribed to `topic`.
    ///
    /// The publishing node never receives its own broadcast. Failing to reach
    /// one subscriber does not stop delivery to the rest.
    async fn publish(
        &self,
        topic: &str,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError>;

    /// Start receiving broadcasts on `topic`. Subscribing twice is a no-op.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Stop receiving broadcasts on `topic`. Unknown topics are ignored.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Get the stream of incoming envelopes.
    ///
    /// Intended to be taken once by the owning node.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

    /// Shutdown the transport and release the connection
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Configuration shared by transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of each node's inbound queue
    pub inbound_queue_size: usize,
    /// How long a send may wait for space in a full inbound queue
    pub send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbound_queue_size: 1024,
            send_timeout: Duration::from_secs(5),
        }
    }
}
