//! RPC between services, locally and across nodes

mod common;

use std::time::Duration;

use common::{Counter, await_service, start_cluster, start_node, unique_bus};
use dse_node::observe::retry_until;
use dse_node::{DseError, table};
use pretty_assertions::assert_eq;
use serde_json::json;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_local_rpc() {
    let (node, _transport) = start_node(&unique_bus("rpc-local"), "n0").await;
    let counter = node.register_service(Counter::new("counter")).await.unwrap();

    let total = node
        .invoke_service_rpc("counter", "add", vec![json!(5)], None)
        .await
        .unwrap();
    assert_eq!(total, json!(5));
    assert_eq!(counter.read(|c| c.total), 5);
}

#[tokio::test]
#[traced_test]
async fn test_remote_rpc() {
    let cluster = start_cluster("rpc-remote", 2).await;
    let (node_a, _) = &cluster[0];
    let (node_b, _) = &cluster[1];

    node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;

    node_b
        .invoke_service_rpc("counter", "add", vec![json!(2)], None)
        .await
        .unwrap();
    let total = node_b
        .invoke_service_rpc("counter", "add", vec![json!(3)], None)
        .await
        .unwrap();
    assert_eq!(total, json!(5));
    assert_eq!(node_b.pending_rpcs(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_builtin_methods_over_the_channel() {
    let cluster = start_cluster("rpc-builtin", 2).await;
    let (node_a, _) = &cluster[0];
    let (node_b, _) = &cluster[1];

    let counter = node_a.register_service(Counter::new("counter")).await.unwrap();
    counter.publish("history", table![[1, "one"]]).await.unwrap();
    await_service(node_b, "counter").await;

    let tables = node_b
        .invoke_service_rpc("counter", "get_tables", vec![], None)
        .await
        .unwrap();
    assert_eq!(tables, json!(["history"]));

    let snapshot = node_b
        .invoke_service_rpc("counter", "get_snapshot", vec![json!("history")], None)
        .await
        .unwrap();
    assert_eq!(snapshot, json!([[1, "one"]]));

    let status = node_b
        .invoke_service_rpc("counter", "get_status", vec![], None)
        .await
        .unwrap();
    assert_eq!(status["name"], "counter");
    assert_eq!(status["last_message"], serde_json::Value::Null);
}

#[tokio::test]
#[traced_test]
async fn test_rpc_to_unknown_service() {
    let (node, _transport) = start_node(&unique_bus("rpc-unknown"), "n0").await;

    let result = node
        .invoke_service_rpc("nobody", "get_status", vec![], None)
        .await;
    assert!(matches!(result, Err(DseError::NotFound(_))));
}

#[tokio::test]
#[traced_test]
async fn test_rpc_to_unknown_method() {
    let cluster = start_cluster("rpc-method", 2).await;
    let (node_a, _) = &cluster[0];
    let (node_b, _) = &cluster[1];

    node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;

    for node in [node_a, node_b] {
        let result = node
            .invoke_service_rpc("counter", "subtract", vec![json!(1)], None)
            .await;
        assert!(matches!(result, Err(DseError::NotFound(_))), "{result:?}");
    }
}

#[tokio::test]
#[traced_test]
async fn test_remote_error_is_reraised() {
    let cluster = start_cluster("rpc-error", 2).await;
    let (node_a, _) = &cluster[0];
    let (node_b, _) = &cluster[1];

    node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;

    for node in [node_a, node_b] {
        match node
            .invoke_service_rpc("counter", "add", vec![json!(-1)], None)
            .await
        {
            Err(DseError::Remote(message)) => assert_eq!(message, "negative amount"),
            other => panic!("expected a remote error, got {other:?}"),
        }
    }
}

#[tokio::test]
#[traced_test]
async fn test_rpc_to_unregistered_service() {
    let cluster = start_cluster("rpc-unregistered", 2).await;
    let (node_a, _) = &cluster[0];
    let (node_b, _) = &cluster[1];

    node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;
    node_a.unregister_service("counter").await.unwrap();

    let local = node_a
        .invoke_service_rpc("counter", "total", vec![], None)
        .await;
    assert!(matches!(local, Err(DseError::NotFound(_))));

    assert!(retry_until(|| !node_b.get_global_service_names().contains("counter")).await);
    let remote = node_b
        .invoke_service_rpc("counter", "total", vec![], None)
        .await;
    assert!(matches!(remote, Err(DseError::NotFound(_))));
}

#[tokio::test]
#[traced_test]
async fn test_rpc_timeout() {
    let cluster = start_cluster("rpc-timeout", 2).await;
    let (node_a, transport_a) = &cluster[0];
    let (node_b, _) = &cluster[1];

    let counter = node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;

    // The callee processes the request but its response never leaves
    transport_a.set_drop_outbound(true);
    let result = node_b
        .invoke_service_rpc("counter", "total", vec![], Some(Duration::from_millis(100)))
        .await;

    assert!(matches!(result, Err(DseError::Timeout { .. })), "{result:?}");
    assert_eq!(node_b.pending_rpcs(), 0);
    assert!(retry_until(|| counter.read(|c| c.calls) == 1).await);
}

#[tokio::test]
#[traced_test]
async fn test_stopping_caller_fails_pending_rpc() {
    let cluster = start_cluster("rpc-caller-stop", 2).await;
    let (node_a, transport_a) = &cluster[0];
    let (node_b, _) = &cluster[1];

    node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;
    transport_a.set_drop_outbound(true);

    let caller = node_b.clone();
    let call = tokio::spawn(async move {
        caller
            .invoke_service_rpc("counter", "total", vec![], Some(Duration::from_secs(30)))
            .await
    });

    assert!(retry_until(|| node_b.pending_rpcs() == 1).await);
    node_b.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("pending call was not released")
        .unwrap();
    assert!(matches!(result, Err(DseError::Closed)), "{result:?}");
}

#[tokio::test]
#[traced_test]
async fn test_stopping_callee_fails_pending_rpc() {
    let cluster = start_cluster("rpc-callee-stop", 2).await;
    let (node_a, transport_a) = &cluster[0];
    let (node_b, _) = &cluster[1];

    let counter = node_a.register_service(Counter::new("counter")).await.unwrap();
    await_service(node_b, "counter").await;
    transport_a.set_drop_outbound(true);

    let caller = node_b.clone();
    let call = tokio::spawn(async move {
        caller
            .invoke_service_rpc("counter", "total", vec![], Some(Duration::from_secs(30)))
            .await
    });

    // Once the response has been swallowed, let the departure through
    assert!(retry_until(|| counter.read(|c| c.calls) == 1).await);
    transport_a.set_drop_outbound(false);
    node_a.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("pending call was not released")
        .unwrap();
    assert!(matches!(result, Err(DseError::NotFound(_))), "{result:?}");
}

#[tokio::test]
#[traced_test]
async fn test_rpc_after_stop_is_closed() {
    let (node, _transport) = start_node(&unique_bus("rpc-stopped"), "n0").await;
    node.register_service(Counter::new("counter")).await.unwrap();
    node.stop().await.unwrap();

    let result = node
        .invoke_service_rpc("counter", "total", vec![], None)
        .await;
    assert!(matches!(result, Err(DseError::Closed)));
}
