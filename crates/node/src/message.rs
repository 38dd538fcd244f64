//! Protocol spoken between nodes over the message channel

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DseError, DseResult};
use crate::table::Table;

/// Terminal outcome of one RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum RpcOutcome {
    Ok(serde_json::Value),
    NotFound(String),
    Failed(String),
    Closed,
}

impl RpcOutcome {
    pub(crate) fn into_result(self) -> DseResult<serde_json::Value> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::NotFound(what) => Err(DseError::NotFound(what)),
            Self::Failed(reason) => Err(DseError::Remote(reason)),
            Self::Closed => Err(DseError::Closed),
        }
    }
}

/// Messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum DseMessage {
    /// A node joined and wants everyone's service list
    Hello,
    /// Full list of services hosted by the sender
    Announce { services: Vec<String> },
    ServiceRegistered { service: String },
    ServiceUnregistered { service: String },
    /// The sender is stopping
    Goodbye,
    /// Snapshot broadcast on a table topic
    Publish {
        publisher: String,
        table: String,
        seq: u64,
        data: Table,
    },
    SnapshotRequest {
        subscriber: String,
        publisher: String,
        table: String,
    },
    /// Snapshot addressed to a single subscriber
    Snapshot {
        subscriber: String,
        publisher: String,
        table: String,
        seq: u64,
        data: Table,
    },
    RpcRequest {
        service: String,
        method: String,
        args: Vec<serde_json::Value>,
    },
    RpcResponse(RpcOutcome),
}

impl DseMessage {
    pub(crate) const fn message_type(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Announce { .. } => "announce",
            Self::ServiceRegistered { .. } => "service_registered",
            Self::ServiceUnregistered { .. } => "service_unregistered",
            Self::Goodbye => "goodbye",
            Self::Publish { .. } => "publish",
            Self::SnapshotRequest { .. } => "snapshot_request",
            Self::Snapshot { .. } => "snapshot",
            Self::RpcRequest { .. } => "rpc_request",
            Self::RpcResponse(_) => "rpc_response",
        }
    }

    pub(crate) fn encode(&self) -> DseResult<Bytes> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer).map_err(|e| {
            DseError::Serialization(format!("failed to encode {}: {e}", self.message_type()))
        })?;
        Ok(Bytes::from(buffer))
    }

    pub(crate) fn decode(payload: &[u8]) -> DseResult<Self> {
        ciborium::from_reader(payload)
            .map_err(|e| DseError::Serialization(format!("failed to decode message: {e}")))
    }
}

/// Topic carrying publications of one (publisher, table) pair.
///
/// The publisher name is length-prefixed so names containing the separator
/// cannot collide.
pub(crate) fn table_topic(publisher: &str, table: &str) -> String {
    format!("dse.table.{}:{publisher}.{table}", publisher.len())
}
