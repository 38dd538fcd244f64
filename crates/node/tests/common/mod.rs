//! Shared helpers for node integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dse_node::{
    MethodError, MethodRegistry, Node, NodeConfig, NodeId, ReceivedMessage, Service, ServiceCore,
    ServiceHandle, Table,
};
use dse_transport_memory::MemoryTransport;
use uuid::Uuid;

/// A bus name no other test uses
pub fn unique_bus(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Start a node on `bus`, returning it together with its transport
pub async fn start_node(bus: &str, id: &str) -> (Node, Arc<MemoryTransport>) {
    let url = format!("memory://{bus}");
    let transport = Arc::new(MemoryTransport::connect(&url, NodeId::new(id)).unwrap());
    let config = NodeConfig::default()
        .with_transport_url(url)
        .with_rpc_response_timeout(Duration::from_secs(5));

    let node = Node::start(config, transport.clone()).await.unwrap();
    (node, transport)
}

/// Start `count` nodes on a fresh bus, named `n0`, `n1`, ...
pub async fn start_cluster(prefix: &str, count: usize) -> Vec<(Node, Arc<MemoryTransport>)> {
    let bus = unique_bus(prefix);
    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        nodes.push(start_node(&bus, &format!("n{index}")).await);
    }
    nodes
}

/// Wait until `node` sees `service` in the cluster-wide name list
pub async fn await_service(node: &Node, service: &str) {
    assert!(
        dse_node::observe::retry_until(|| node.get_global_service_names().contains(service)).await,
        "{} never learned about {}",
        node.id(),
        service
    );
}

/// Wait until `handle`'s last message carries `expected` on `table`
pub async fn await_message<S: Service>(handle: &ServiceHandle<S>, table: &str, expected: &Table) {
    let arrived = dse_node::observe::retry_until(|| {
        handle
            .last_message()
            .is_some_and(|message| message.table == table && message.data == *expected)
    })
    .await;
    assert!(
        arrived,
        "{} never received {:?} on {}; last message: {:?}",
        handle.name(),
        expected,
        table,
        handle.last_message()
    );
}

/// Assert that `handle` receives nothing for a while
pub async fn assert_silent<S: Service>(handle: &ServiceHandle<S>) {
    let silent = dse_node::observe::Retry::new(10, Duration::from_millis(20))
        .holds(|| handle.last_message().is_none())
        .await;
    assert!(
        silent,
        "{} unexpectedly received {:?}",
        handle.name(),
        handle.last_message()
    );
}

/// Service with nothing but the base behavior
pub struct Probe {
    core: ServiceCore,
    pub received: Vec<ReceivedMessage>,
}

impl Probe {
    pub fn new(name: &str) -> Self {
        Self {
            core: ServiceCore::new(name),
            received: Vec::new(),
        }
    }
}

impl Service for Probe {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    fn receive(&mut self, message: ReceivedMessage) {
        self.received.push(message.clone());
        self.core.record(message);
    }
}

/// Service with a couple of application methods
pub struct Counter {
    core: ServiceCore,
    pub total: i64,
    pub calls: u32,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            core: ServiceCore::new(name),
            total: 0,
            calls: 0,
        }
    }
}

impl Service for Counter {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    fn register_methods(methods: &mut MethodRegistry<Self>) -> dse_node::DseResult<()> {
        methods.register("add", |counter: &mut Self, args| {
            counter.calls += 1;
            let amount = args
                .first()
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| MethodError::new("add expects an integer"))?;
            if amount < 0 {
                return Err(MethodError::new("negative amount"));
            }
            counter.total += amount;
            Ok(serde_json::json!(counter.total))
        })?;
        methods.register("total", |counter: &mut Self, _args| {
            counter.calls += 1;
            Ok(serde_json::json!(counter.total))
        })
    }
}
