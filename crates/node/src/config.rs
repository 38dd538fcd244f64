//! Node configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default topic carrying service registration announcements
pub const DEFAULT_MEMBERSHIP_TOPIC: &str = "dse.membership";

/// Configuration consumed by a [`Node`](crate::Node)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address of the message channel, handed to the transport as-is
    pub transport_url: String,

    /// Deadline applied to RPCs that do not pass their own
    pub rpc_response_timeout: Duration,

    /// Topic on which nodes announce the services they host
    pub membership_topic: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transport_url: "memory://".to_string(),
            rpc_response_timeout: Duration::from_secs(30),
            membership_topic: DEFAULT_MEMBERSHIP_TOPIC.to_string(),
        }
    }
}

impl NodeConfig {
    /// Set the transport URL
    #[must_use]
    pub fn with_transport_url(mut self, url: impl Into<String>) -> Self {
        self.transport_url = url.into();
        self
    }

    /// Set the default RPC deadline
    #[must_use]
    pub const fn with_rpc_response_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_response_timeout = timeout;
        self
    }

    /// Set the membership topic
    #[must_use]
    pub fn with_membership_topic(mut self, topic: impl Into<String>) -> Self {
        self.membership_topic = topic.into();
        self
    }
}
