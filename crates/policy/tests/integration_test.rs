//! Policy engines fed by data sources through live nodes

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dse_node::observe::retry_until;
use dse_node::{
    DataSourceService, DseError, MemoryDriver, Node, NodeConfig, NodeId, ReceivedMessage,
    Service, ServiceCore, ServiceHandle, table,
};
use dse_policy::{
    Atom, DEFAULT_POLICY, PolicyApi, PolicyEngine, PolicyError, PolicyEvent, Rule, Term,
};
use dse_transport::Transport;
use dse_transport_memory::MemoryTransport;
use pretty_assertions::assert_eq;
use serde_json::json;
use tracing_test::traced_test;
use uuid::Uuid;

fn unique_bus(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn start_node_with_transport(bus: &str, id: &str) -> (Node, Arc<MemoryTransport>) {
    let url = format!("memory://{bus}");
    let transport = Arc::new(MemoryTransport::connect(&url, NodeId::new(id)).unwrap());
    let node = Node::start(NodeConfig::default().with_transport_url(url), transport.clone())
        .await
        .unwrap();
    (node, transport)
}

async fn start_node(bus: &str, id: &str) -> Node {
    start_node_with_transport(bus, id).await.0
}

struct Watcher {
    core: ServiceCore,
}

impl Service for Watcher {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    fn receive(&mut self, message: ReceivedMessage) {
        self.core.record(message);
    }
}

fn p_of_x() -> Atom {
    Atom::new("p", vec![Term::var("x")])
}

/// p(x) :- data:fake_table(x)
fn p_from_fake_table() -> Rule {
    Rule::new(
        p_of_x(),
        vec![Atom::external("data", "fake_table", vec![Term::var("x")])],
    )
}

async fn await_facts(
    engine: &ServiceHandle<PolicyEngine>,
    policy: &str,
    query: &Atom,
    expected: &[&str],
) {
    let expected: BTreeSet<String> = expected.iter().map(ToString::to_string).collect();
    let rendered = || -> BTreeSet<String> {
        engine
            .select(policy, query)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    };
    assert!(
        retry_until(|| rendered() == expected).await,
        "{policy} derived {:?}, expected {:?}",
        rendered(),
        expected
    );
}

#[tokio::test]
#[traced_test]
async fn test_policy_over_datasource() {
    let node = start_node(&unique_bus("policy-alpha"), "n0").await;

    let driver = MemoryDriver::new();
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();

    driver.set_table("fake_table", table![[1], [2]]);
    data.poll().await.unwrap();

    await_facts(&engine, "alpha", &p_of_x(), &["p(1)", "p(2)"]).await;
}

#[tokio::test]
#[traced_test]
async fn test_policy_reads_service_named_like_policy() {
    let node = start_node(&unique_bus("policy-shadow"), "n0").await;

    let driver = MemoryDriver::new();
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    engine.create_policy("data").await.unwrap();
    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();

    driver.set_table("fake_table", table![[1], [2]]);
    data.poll().await.unwrap();

    await_facts(&engine, "alpha", &p_of_x(), &["p(1)", "p(2)"]).await;
}

#[tokio::test]
#[traced_test]
async fn test_policy_across_nodes() {
    let bus = unique_bus("policy-internode");
    let node_a = start_node(&bus, "a").await;
    let node_b = start_node(&bus, "b").await;

    let driver = MemoryDriver::new();
    driver.set_table("fake_table", table![[1], [2]]);
    let data = node_a
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    data.poll().await.unwrap();

    let engine = node_b
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();
    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();

    // Picked up from the subscription snapshot, without another poll
    await_facts(&engine, "alpha", &p_of_x(), &["p(1)", "p(2)"]).await;

    driver.set_table("fake_table", table![[2], [3]]);
    data.poll().await.unwrap();
    await_facts(&engine, "alpha", &p_of_x(), &["p(2)", "p(3)"]).await;
}

#[tokio::test]
#[traced_test]
async fn test_untargeted_events_use_default_policy() {
    let node = start_node(&unique_bus("policy-default"), "n0").await;
    let driver = MemoryDriver::new();
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    engine
        .process_policy_update(vec![PolicyEvent::insert(p_from_fake_table())])
        .await
        .unwrap();
    driver.set_table("fake_table", table![[4]]);
    data.poll().await.unwrap();

    await_facts(&engine, DEFAULT_POLICY, &p_of_x(), &["p(4)"]).await;
    assert_eq!(engine.policy_names(), vec![DEFAULT_POLICY.to_string()]);
}

#[tokio::test]
#[traced_test]
async fn test_rejected_batch_changes_nothing() {
    let node = start_node(&unique_bus("policy-atomic"), "n0").await;
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();
    engine.create_policy("alpha").await.unwrap();

    let unsafe_rule = Rule::new(
        Atom::new("q", vec![Term::var("y")]),
        vec![Atom::external("data", "fake_table", vec![Term::var("x")])],
    );
    let result = engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
            PolicyEvent::insert(unsafe_rule).with_target("alpha"),
        ])
        .await;

    assert!(matches!(result, Err(PolicyError::UnsafeRule { .. })));
    assert!(engine.read(|e| e.policy("alpha").unwrap().rules().is_empty()));
    assert!(engine.subscriptions().is_empty());

    assert!(matches!(
        engine.create_policy("alpha").await,
        Err(PolicyError::DuplicateName(_))
    ));
}

#[tokio::test]
#[traced_test]
async fn test_rule_updates_follow_subscriptions() {
    let node = start_node(&unique_bus("policy-subscriptions"), "n0").await;
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    engine
        .process_policy_update(vec![PolicyEvent::insert(p_from_fake_table())])
        .await
        .unwrap();
    let subscribed: Vec<_> = engine
        .subscriptions()
        .into_iter()
        .map(|s| (s.publisher, s.table))
        .collect();
    assert_eq!(
        subscribed,
        vec![("data".to_string(), "fake_table".to_string())]
    );

    engine
        .process_policy_update(vec![PolicyEvent::delete(p_from_fake_table())])
        .await
        .unwrap();
    assert!(engine.subscriptions().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_derived_tables_are_published() {
    let node = start_node(&unique_bus("policy-publish"), "n0").await;
    let driver = MemoryDriver::new();
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();
    let watcher = node
        .register_service(Watcher {
            core: ServiceCore::new("watcher"),
        })
        .await
        .unwrap();

    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();
    watcher.subscribe("policy", "alpha:p").await.unwrap();

    driver.set_table("fake_table", table![[1], [2]]);
    data.poll().await.unwrap();

    assert!(
        retry_until(|| watcher
            .last_message()
            .is_some_and(|m| m.table == "alpha:p" && m.data == table![[1], [2]]))
        .await
    );
}

#[tokio::test]
#[traced_test]
async fn test_policy_rpc_methods() {
    let node = start_node(&unique_bus("policy-rpc"), "n0").await;
    let driver = MemoryDriver::new();
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();
    driver.set_table("fake_table", table![[1], [2]]);
    data.poll().await.unwrap();
    await_facts(&engine, "alpha", &p_of_x(), &["p(1)", "p(2)"]).await;

    let policies = node
        .invoke_service_rpc("policy", "get_policies", vec![], None)
        .await
        .unwrap();
    assert_eq!(policies, json!(["alpha", DEFAULT_POLICY]));

    let rules = node
        .invoke_service_rpc("policy", "get_rules", vec![json!("alpha")], None)
        .await
        .unwrap();
    assert_eq!(rules, json!(["p(x) :- data:fake_table(x)"]));

    let facts = node
        .invoke_service_rpc(
            "policy",
            "select",
            vec![json!("alpha"), json!("p")],
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(facts, json!([[1], [2]]));

    let missing = node
        .invoke_service_rpc("policy", "get_rules", vec![json!("beta")], None)
        .await;
    assert!(matches!(missing, Err(DseError::Remote(_))));
}

#[tokio::test]
#[traced_test]
async fn test_delete_policy_withdraws_facts() {
    let node = start_node(&unique_bus("policy-delete"), "n0").await;
    let driver = MemoryDriver::new();
    driver.set_table("fake_table", table![[1]]);
    let data = node
        .register_service(DataSourceService::new("data", driver.clone()))
        .await
        .unwrap();
    data.poll().await.unwrap();
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();
    let watcher = node
        .register_service(Watcher {
            core: ServiceCore::new("watcher"),
        })
        .await
        .unwrap();

    engine.create_policy("alpha").await.unwrap();
    engine
        .process_policy_update(vec![
            PolicyEvent::insert(p_from_fake_table()).with_target("alpha"),
        ])
        .await
        .unwrap();
    watcher.subscribe("policy", "alpha:p").await.unwrap();
    await_facts(&engine, "alpha", &p_of_x(), &["p(1)"]).await;
    assert!(
        retry_until(|| watcher
            .last_message()
            .is_some_and(|m| m.table == "alpha:p" && m.data == table![[1]]))
        .await
    );

    engine.delete_policy("alpha").await.unwrap();
    assert!(matches!(
        engine.select("alpha", &p_of_x()),
        Err(PolicyError::NotFound(_))
    ));
    assert!(engine.subscriptions().is_empty());
    assert!(
        retry_until(|| watcher
            .last_message()
            .is_some_and(|m| m.table == "alpha:p" && m.data.is_empty()))
        .await
    );
    assert!(matches!(
        engine.delete_policy("alpha").await,
        Err(PolicyError::NotFound(_))
    ));
}

#[tokio::test]
#[traced_test]
async fn test_refused_subscription_is_reported() {
    let (node, transport) = start_node_with_transport(&unique_bus("policy-refused"), "n0").await;
    let engine = node
        .register_service(PolicyEngine::new("policy"))
        .await
        .unwrap();

    transport.shutdown().await.unwrap();

    let result = engine
        .process_policy_update(vec![PolicyEvent::insert(p_from_fake_table())])
        .await;
    assert!(matches!(result, Err(PolicyError::Dse(DseError::Channel(_)))));

    // The rule is in, the subscription is not, and nothing claims otherwise
    assert_eq!(
        engine.read(|e| e.policy(DEFAULT_POLICY).unwrap().rules().len()),
        1
    );
    assert!(engine.subscriptions().is_empty());
    assert!(engine.read(|e| e.subscribed().is_empty()));
}
