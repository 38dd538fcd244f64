//! Bookkeeping for RPCs awaiting a response from another node

use std::time::Instant;

use dashmap::DashMap;
use dse_transport::NodeId;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::message::RpcOutcome;

struct PendingRequest {
    tx: oneshot::Sender<RpcOutcome>,
    service: String,
    node: NodeId,
    sent_at: Instant,
}

/// Outstanding remote calls keyed by correlation id.
///
/// Each entry is resolved at most once: whoever removes it from the map owns
/// the reply channel.
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: DashMap<Uuid, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn insert(
        &self,
        correlation_id: Uuid,
        service: &str,
        node: &NodeId,
    ) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            correlation_id,
            PendingRequest {
                tx,
                service: service.to_string(),
                node: node.clone(),
                sent_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolve a request; false when it was already resolved or unknown
    pub(crate) fn complete(&self, correlation_id: Uuid, outcome: RpcOutcome) -> bool {
        let Some((_, request)) = self.requests.remove(&correlation_id) else {
            return false;
        };

        debug!(
            "Resolving request {} to {} on {} after {:?}",
            correlation_id,
            request.service,
            request.node,
            request.sent_at.elapsed()
        );
        let _ = request.tx.send(outcome);
        true
    }

    /// Forget a request without resolving it
    pub(crate) fn cancel(&self, correlation_id: Uuid) {
        self.requests.remove(&correlation_id);
    }

    pub(crate) fn fail_service(&self, service: &str, outcome: &RpcOutcome) -> usize {
        self.fail_matching(|request| request.service == service, outcome)
    }

    pub(crate) fn fail_node(&self, node: &NodeId, outcome: &RpcOutcome) -> usize {
        self.fail_matching(|request| request.node == *node, outcome)
    }

    pub(crate) fn fail_all(&self, outcome: &RpcOutcome) -> usize {
        self.fail_matching(|_| true, outcome)
    }

    fn fail_matching<F>(&self, predicate: F, outcome: &RpcOutcome) -> usize
    where
        F: Fn(&PendingRequest) -> bool,
    {
        let ids: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter(|id| self.complete(*id, outcome.clone()))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_resolution() {
        let pending = PendingRequests::default();
        let id = Uuid::new_v4();
        let rx = pending.insert(id, "svc", &NodeId::new("a"));

        assert!(pending.complete(id, RpcOutcome::Ok(serde_json::json!(1))));
        assert!(!pending.complete(id, RpcOutcome::Closed));
        assert_eq!(rx.await.unwrap(), RpcOutcome::Ok(serde_json::json!(1)));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_by_service_and_node() {
        let pending = PendingRequests::default();
        let a = NodeId::new("a");
        let b = NodeId::new("b");

        let on_a = pending.insert(Uuid::new_v4(), "x", &a);
        let other_on_a = pending.insert(Uuid::new_v4(), "y", &a);
        let on_b = pending.insert(Uuid::new_v4(), "z", &b);

        let not_found = RpcOutcome::NotFound("service x".to_string());
        assert_eq!(pending.fail_service("x", &not_found), 1);
        assert_eq!(on_a.await.unwrap(), not_found);

        assert_eq!(pending.fail_node(&a, &RpcOutcome::Closed), 1);
        assert_eq!(other_on_a.await.unwrap(), RpcOutcome::Closed);

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.fail_all(&RpcOutcome::Closed), 1);
        assert_eq!(on_b.await.unwrap(), RpcOutcome::Closed);
    }
}
