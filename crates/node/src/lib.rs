//! Node runtime of the distributed service engine.
//!
//! A [`Node`] hosts named services on one message channel connection. Services
//! own named tables of tuples, publish complete snapshots of them, subscribe to
//! tables of other services and answer RPCs. Whether two services share a node
//! or not is invisible to them: the node picks a direct local path or a relay
//! over the channel depending on where the target lives.
//!
//! Two service variants ship with this crate's building blocks:
//! - [`DataSourceService`], mirroring tables from an external system
//! - policy engines, built on [`Service`] in a separate crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod datasource;
mod directory;
mod error;
mod message;
mod method;
mod node;
pub mod observe;
mod rpc;
mod service;
mod subscriptions;
mod table;

pub use config::{DEFAULT_MEMBERSHIP_TOPIC, NodeConfig};
pub use datasource::{DataSourceService, Driver, DriverError, MemoryDriver};
pub use directory::ServiceDirectory;
pub use dse_transport::NodeId;
pub use error::{DseError, DseResult};
pub use method::{MethodError, MethodRegistry, MethodResult, arg_str};
pub use node::{Node, NodeState};
pub use service::{ReceivedMessage, Service, ServiceCore, ServiceHandle};
pub use subscriptions::{SubscribeOutcome, Subscription, SubscriptionRegistry, UnsubscribeOutcome};
pub use table::{Row, Table, Tables, Value, table_to_json};
