//! Eventually consistent view of services hosted by remote nodes.
//!
//! Built purely from membership announcements. It lags behind reality while
//! announcements are in flight, so lookups are a best-effort snapshot.

use std::collections::{BTreeSet, HashMap};

use dse_transport::NodeId;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<String, NodeId>,
    nodes: HashMap<NodeId, BTreeSet<String>>,
}

impl Inner {
    fn insert(&mut self, node: &NodeId, service: &str) {
        if let Some(previous) = self.services.insert(service.to_string(), node.clone()) {
            if previous != *node {
                if let Some(owned) = self.nodes.get_mut(&previous) {
                    owned.remove(service);
                }
            }
        }
        self.nodes
            .entry(node.clone())
            .or_default()
            .insert(service.to_string());
    }

    fn remove(&mut self, node: &NodeId, service: &str) -> bool {
        if let Some(owned) = self.nodes.get_mut(node) {
            owned.remove(service);
            if owned.is_empty() {
                self.nodes.remove(node);
            }
        }

        if self.services.get(service) == Some(node) {
            self.services.remove(service);
            true
        } else {
            false
        }
    }
}

/// Remote service name to hosting node
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    inner: RwLock<Inner>,
}

impl ServiceDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` hosts `service`
    pub fn insert(&self, node: &NodeId, service: &str) {
        self.inner.write().insert(node, service);
    }

    /// Forget `service` if it is recorded on `node`.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, node: &NodeId, service: &str) -> bool {
        self.inner.write().remove(node, service)
    }

    /// Replace everything known about `node` with a full service list.
    ///
    /// Returns the services that appeared and those that vanished.
    pub fn replace_node(&self, node: &NodeId, services: &[String]) -> (Vec<String>, Vec<String>) {
        let mut inner = self.inner.write();
        let previous = inner.nodes.get(node).cloned().unwrap_or_default();
        let current: BTreeSet<String> = services.iter().cloned().collect();

        let vanished: Vec<String> = previous.difference(&current).cloned().collect();
        let appeared: Vec<String> = current.difference(&previous).cloned().collect();

        for service in &vanished {
            inner.remove(node, service);
        }
        for service in &appeared {
            inner.insert(node, service);
        }

        (appeared, vanished)
    }

    /// Forget a node entirely, returning the services it hosted
    pub fn remove_node(&self, node: &NodeId) -> Vec<String> {
        let mut inner = self.inner.write();
        let owned = inner.nodes.remove(node).unwrap_or_default();
        owned
            .into_iter()
            .filter(|service| {
                if inner.services.get(service) == Some(node) {
                    inner.services.remove(service);
                    true
                } else {
                    false
                }
            })
            .collect()
    }

    /// Node currently believed to host `service`
    #[must_use]
    pub fn locate(&self, service: &str) -> Option<NodeId> {
        self.inner.read().services.get(service).cloned()
    }

    /// All known remote service names
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.inner.read().services.keys().cloned().collect()
    }
}
