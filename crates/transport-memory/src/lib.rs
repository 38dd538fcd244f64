//! In-memory message channel.
//!
//! Routes envelopes between nodes inside the same process. Nodes are grouped
//! into buses named by the transport URL (`memory://<bus>`): nodes on the same
//! bus can reach each other, nodes on different buses cannot. This keeps
//! concurrently running tests isolated from one another.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashSet;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dse_transport::{Config, NodeId, Transport, TransportEnvelope, TransportError};
use futures::Stream;
use once_cell::sync::Lazy;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// URL scheme accepted by [`MemoryTransport::connect`]
pub const SCHEME: &str = "memory";

/// Bus used when the URL names none
pub const DEFAULT_BUS: &str = "default";

/// Global registry of buses, keyed by bus name
static GLOBAL_REGISTRY: Lazy<DashMap<String, Arc<MemoryBus>>> = Lazy::new(DashMap::new);

/// A named group of nodes that can reach one another
#[derive(Debug, Default)]
struct MemoryBus {
    nodes: DashMap<NodeId, flume::Sender<TransportEnvelope>>,
    topics: DashMap<String, HashSet<NodeId>>,
}

impl MemoryBus {
    fn sender(&self, node_id: &NodeId) -> Option<flume::Sender<TransportEnvelope>> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    fn subscribers(&self, topic: &str) -> Vec<NodeId> {
        self.topics
            .get(topic)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn detach(&self, node_id: &NodeId) {
        self.nodes.remove(node_id);
        self.topics.retain(|_, nodes| {
            nodes.remove(node_id);
            !nodes.is_empty()
        });
    }
}

/// Options for attaching a node to a bus
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Name of the bus to attach to
    pub bus: String,
    /// Identity of the attaching node
    pub node_id: NodeId,
    /// Queue sizing and send timeouts
    pub config: Config,
}

impl MemoryOptions {
    /// Options for `node_id` on `bus` with default queue settings
    pub fn new(bus: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            bus: bus.into(),
            node_id,
            config: Config::default(),
        }
    }
}

/// Memory transport implementation
pub struct MemoryTransport {
    node_id: NodeId,
    bus_name: String,
    bus: Arc<MemoryBus>,
    receiver: flume::Receiver<TransportEnvelope>,
    config: Config,
    closed: AtomicBool,
    drop_outbound: AtomicBool,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("node_id", &self.node_id)
            .field("bus", &self.bus_name)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Attach a node to a bus, creating the bus if needed.
    ///
    /// # Errors
    ///
    /// Fails if a node with the same id is already attached to the bus.
    pub fn attach(options: MemoryOptions) -> Result<Self, TransportError> {
        let MemoryOptions {
            bus: bus_name,
            node_id,
            config,
        } = options;

        let bus = GLOBAL_REGISTRY
            .entry(bus_name.clone())
            .or_default()
            .value()
            .clone();

        let (tx, rx) = flume::bounded(config.inbound_queue_size);
        match bus.nodes.entry(node_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::AlreadyAttached(node_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        info!("Node {} attached to memory bus '{}'", node_id, bus_name);

        Ok(Self {
            node_id,
            bus_name,
            bus,
            receiver: rx,
            config,
            closed: AtomicBool::new(false),
            drop_outbound: AtomicBool::new(false),
        })
    }

    /// Attach a node to the bus named by a `memory://<bus>` URL.
    ///
    /// # Errors
    ///
    /// Fails on malformed URLs, foreign schemes, or a duplicate node id.
    pub fn connect(url: &str, node_id: NodeId) -> Result<Self, TransportError> {
        let bus = Self::parse_bus(url)?;
        Self::attach(MemoryOptions::new(bus, node_id))
    }

    fn parse_bus(url: &str) -> Result<String, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::InvalidAddress(format!("{url}: {e}")))?;

        if parsed.scheme() != SCHEME {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported scheme '{}' in {url}",
                parsed.scheme()
            )));
        }

        Ok(parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .unwrap_or(DEFAULT_BUS)
            .to_string())
    }

    /// Name of the bus this transport is attached to
    #[must_use]
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// Silently discard everything this node sends from now on.
    ///
    /// Simulates a node that has stopped answering without leaving the bus.
    pub fn set_drop_outbound(&self, drop: bool) {
        self.drop_outbound.store(drop, Ordering::SeqCst);
    }

    /// Clear all global state (useful for tests)
    pub fn clear_global_state() {
        GLOBAL_REGISTRY.clear();
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn deliver(
        &self,
        recipient: &NodeId,
        envelope: TransportEnvelope,
    ) -> Result<(), TransportError> {
        let sender = self
            .bus
            .sender(recipient)
            .ok_or_else(|| TransportError::NoRoute(recipient.clone()))?;

        match timeout(self.config.send_timeout, sender.send_async(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NoRoute(recipient.clone())),
            Err(_) => Err(TransportError::Other(format!(
                "inbound queue of {recipient} full for {:?}",
                self.config.send_timeout
            ))),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.drop_outbound.load(Ordering::SeqCst) {
            debug!("Dropping {} to {} (outbound disabled)", message_type, recipient);
            return Ok(());
        }

        debug!(
            "Sending {} ({} bytes) from {} to {}",
            message_type,
            payload.len(),
            self.node_id,
            recipient
        );

        let envelope = TransportEnvelope {
            correlation_id,
            message_type: message_type.to_string(),
            payload: payload.clone(),
            sender: self.node_id.clone(),
            topic: None,
        };
        self.deliver(recipient, envelope).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.drop_outbound.load(Ordering::SeqCst) {
            debug!("Dropping {} on '{}' (outbound disabled)", message_type, topic);
            return Ok(());
        }

        for recipient in self.bus.subscribers(topic) {
            if recipient == self.node_id {
                continue;
            }

            let envelope = TransportEnvelope {
                correlation_id: None,
                message_type: message_type.to_string(),
                payload: payload.clone(),
                sender: self.node_id.clone(),
                topic: Some(topic.to_string()),
            };
            if let Err(e) = self.deliver(&recipient, envelope).await {
                warn!("Failed to deliver '{}' to {}: {}", topic, recipient, e);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.bus
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.node_id.clone());
        debug!("Node {} subscribed to '{}'", self.node_id, topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.bus.topics.remove_if_mut(topic, |_, nodes| {
            nodes.remove(&self.node_id);
            nodes.is_empty()
        });
        debug!("Node {} unsubscribed from '{}'", self.node_id, topic);
        Ok(())
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>> {
        Box::pin(self.receiver.clone().into_stream())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.bus.detach(&self.node_id);
        info!(
            "Node {} detached from memory bus '{}'",
            self.node_id, self.bus_name
        );
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.detach(&self.node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bus() {
        assert_eq!(MemoryTransport::parse_bus("memory://alpha").unwrap(), "alpha");
        assert_eq!(MemoryTransport::parse_bus("memory://").unwrap(), DEFAULT_BUS);
        assert!(matches!(
            MemoryTransport::parse_bus("tcp://alpha"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            MemoryTransport::parse_bus("not a url"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_node_already_attached() {
        let _ = tracing_subscriber::fmt::try_init();

        let node_id = NodeId::new("dup");
        let _first = MemoryTransport::connect("memory://unit-dup", node_id.clone()).unwrap();

        let second = MemoryTransport::connect("memory://unit-dup", node_id.clone());
        assert!(matches!(second, Err(TransportError::AlreadyAttached(_))));

        // Same id on another bus is fine
        let _other = MemoryTransport::connect("memory://unit-dup-other", node_id).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_detaches() {
        let _ = tracing_subscriber::fmt::try_init();

        let node_id = NodeId::new("leaver");
        let transport = MemoryTransport::connect("memory://unit-detach", node_id.clone()).unwrap();
        transport.subscribe("t").await.unwrap();
        transport.shutdown().await.unwrap();
        transport.shutdown().await.unwrap();

        let bus = GLOBAL_REGISTRY.get("unit-detach").unwrap().value().clone();
        assert!(bus.sender(&node_id).is_none());
        assert!(bus.subscribers("t").is_empty());
        assert!(matches!(
            transport.subscribe("t").await,
            Err(TransportError::ConnectionClosed)
        ));

        // The id can be reused once detached
        let _again = MemoryTransport::connect("memory://unit-detach", node_id).unwrap();
    }
}
