//! The node: local service registry, message routing and RPC.
//!
//! Each node runs two background tasks. The router drains the transport,
//! resolves RPC responses and membership updates immediately, and queues
//! everything that touches service state. The dispatcher runs those queued
//! jobs one at a time, so a node never has two messages inside its services
//! at once. Different nodes run fully independently.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dse_transport::{NodeId, Transport, TransportEnvelope};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::directory::ServiceDirectory;
use crate::error::{DseError, DseResult};
use crate::message::{DseMessage, RpcOutcome, table_topic};
use crate::method::MethodRegistry;
use crate::rpc::PendingRequests;
use crate::service::{Hosted, HostedService, Publication, ReceivedMessage, Service, ServiceHandle};
use crate::subscriptions::{SubscribeOutcome, Subscription, SubscriptionRegistry, UnsubscribeOutcome};
use crate::table::Table;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Accepting registrations and traffic
    Running,
    /// Shutdown in progress
    Stopping,
    /// Shut down; the channel connection is released
    Stopped,
}

/// Where a named service currently lives
enum Route {
    Local(Arc<dyn HostedService>),
    Remote(NodeId),
}

/// Work that touches service state, run by the dispatcher in order
enum Job {
    Deliver {
        subscriber: String,
        publisher: String,
        table: String,
        seq: u64,
        data: Table,
    },
    LocalSnapshot {
        subscriber: String,
        publisher: String,
        table: String,
    },
    ServeSnapshot {
        requester: NodeId,
        subscriber: String,
        publisher: String,
        table: String,
    },
    Rpc {
        service: String,
        method: String,
        args: Vec<serde_json::Value>,
        reply: oneshot::Sender<RpcOutcome>,
    },
    RemoteRpc {
        caller: NodeId,
        correlation_id: Uuid,
        service: String,
        method: String,
        args: Vec<serde_json::Value>,
    },
}

struct NodeInner {
    id: NodeId,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    services: DashMap<String, Arc<dyn HostedService>>,
    subscriptions: SubscriptionRegistry,
    directory: ServiceDirectory,
    pending: PendingRequests,
    jobs: flume::Sender<Job>,
    job_queue: flume::Receiver<Job>,
    state: RwLock<NodeState>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

/// A process-level container hosting named services on one channel
/// connection. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.read())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node on an attached transport.
    ///
    /// The node takes its identity from the transport, joins the membership
    /// topic and asks the other nodes which services they host.
    ///
    /// # Errors
    ///
    /// Fails when the transport refuses the membership subscription or the
    /// initial announcement.
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> DseResult<Self> {
        let (jobs, job_queue) = flume::unbounded();
        let node = Self {
            inner: Arc::new(NodeInner {
                id: transport.local_id().clone(),
                config,
                transport,
                services: DashMap::new(),
                subscriptions: SubscriptionRegistry::new(),
                directory: ServiceDirectory::new(),
                pending: PendingRequests::default(),
                jobs,
                job_queue: job_queue.clone(),
                state: RwLock::new(NodeState::Running),
                task_tracker: TaskTracker::new(),
                cancellation_token: CancellationToken::new(),
            }),
        };

        node.inner
            .transport
            .subscribe(&node.inner.config.membership_topic)
            .await?;
        node.spawn_router();
        node.spawn_dispatcher(job_queue);
        node.broadcast(&DseMessage::Hello).await?;

        info!("Node {} started", node.inner.id);
        Ok(node)
    }

    /// Node identity
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Configuration the node was started with
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub(crate) fn ensure_running(&self) -> DseResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DseError::Closed)
        }
    }

    // Lifecycle

    /// Stop the node: announce departure, cancel the background tasks, fail
    /// every pending RPC with [`DseError::Closed`] and release the channel.
    ///
    /// Stopping a node that is already stopping or stopped does nothing.
    ///
    /// # Errors
    ///
    /// Currently infallible; channel failures during shutdown are logged.
    pub async fn stop(&self) -> DseResult<()> {
        {
            let mut state = self.inner.state.write();
            if *state != NodeState::Running {
                return Ok(());
            }
            *state = NodeState::Stopping;
        }

        info!("Stopping node {}", self.inner.id);

        if let Err(e) = self.broadcast(&DseMessage::Goodbye).await {
            warn!("Node {} could not announce departure: {}", self.inner.id, e);
        }

        self.inner.cancellation_token.cancel();

        // Queued local calls resolve as closed once their reply senders drop
        let abandoned = self.inner.job_queue.drain().count();
        if abandoned > 0 {
            debug!("Dropped {} queued jobs on shutdown", abandoned);
        }

        let failed = self.inner.pending.fail_all(&RpcOutcome::Closed);
        if failed > 0 {
            debug!("Failed {} pending requests on shutdown", failed);
        }

        if let Err(e) = self.inner.transport.shutdown().await {
            warn!("Transport shutdown failed for {}: {}", self.inner.id, e);
        }

        self.inner.task_tracker.close();
        *self.inner.state.write() = NodeState::Stopped;

        info!("Node {} stopped", self.inner.id);
        Ok(())
    }

    /// Wait until every background task has finished. Only returns once
    /// [`stop`](Self::stop) has been called.
    pub async fn wait(&self) {
        self.inner.task_tracker.wait().await;
    }

    // Service registry

    /// Register a service under its name and announce it to the cluster.
    ///
    /// # Errors
    ///
    /// - [`DseError::DuplicateName`] when the name is taken locally or known
    ///   to be taken on another node, or the service declares a method twice
    /// - [`DseError::Closed`] after [`stop`](Self::stop)
    pub async fn register_service<S: Service>(&self, service: S) -> DseResult<ServiceHandle<S>> {
        self.ensure_running()?;

        let name = service.name().to_string();
        let mut methods = MethodRegistry::with_builtins();
        S::register_methods(&mut methods)?;

        if let Some(owner) = self.inner.directory.locate(&name) {
            debug!("Service {} already hosted by {}", name, owner);
            return Err(DseError::DuplicateName(name));
        }

        let hosted = Hosted::new(service, methods);
        let handle = hosted.handle(name.clone(), self.clone());
        match self.inner.services.entry(name.clone()) {
            Entry::Occupied(_) => return Err(DseError::DuplicateName(name)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(hosted));
            }
        }

        info!("Registered service {} on node {}", name, self.inner.id);

        if let Err(e) = self
            .broadcast(&DseMessage::ServiceRegistered {
                service: name.clone(),
            })
            .await
        {
            warn!("Could not announce service {}: {}", name, e);
        }

        for subscription in self.inner.subscriptions.awaiting_snapshot(&name) {
            self.enqueue(Job::LocalSnapshot {
                subscriber: subscription.subscriber,
                publisher: subscription.publisher,
                table: subscription.table,
            })?;
        }

        Ok(handle)
    }

    /// Remove a local service, tear down every subscription it takes part in
    /// and announce its departure.
    ///
    /// RPCs still queued for it resolve with [`DseError::NotFound`].
    ///
    /// # Errors
    ///
    /// Fails with [`DseError::NotFound`] when no such service is registered
    /// here.
    pub async fn unregister_service(&self, name: &str) -> DseResult<()> {
        if self.inner.services.remove(name).is_none() {
            return Err(DseError::NotFound(format!("service {name}")));
        }

        let idle = self.inner.subscriptions.remove_service(name);
        self.release_topics(idle).await;

        info!("Unregistered service {} from node {}", name, self.inner.id);

        if self.is_running() {
            if let Err(e) = self
                .broadcast(&DseMessage::ServiceUnregistered {
                    service: name.to_string(),
                })
                .await
            {
                warn!("Could not announce removal of {}: {}", name, e);
            }
        }

        Ok(())
    }

    /// Names of services registered on this node
    #[must_use]
    pub fn local_service_names(&self) -> BTreeSet<String> {
        self.inner
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every service name known cluster-wide.
    ///
    /// Best effort: built from membership announcements, so it lags behind
    /// registrations happening elsewhere at the same time. Treat the result
    /// as a snapshot.
    #[must_use]
    pub fn get_global_service_names(&self) -> BTreeSet<String> {
        let mut names = self.inner.directory.names();
        names.extend(self.local_service_names());
        names
    }

    pub(crate) fn hosts(&self, name: &str, slot_id: usize) -> bool {
        self.inner
            .services
            .get(name)
            .is_some_and(|entry| entry.value().slot_id() == slot_id)
    }

    fn local(&self, name: &str) -> Option<Arc<dyn HostedService>> {
        self.inner
            .services
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn route(&self, service: &str) -> Option<Route> {
        self.local(service).map(Route::Local).or_else(|| {
            self.inner
                .directory
                .locate(service)
                .map(Route::Remote)
        })
    }

    // Subscriptions

    /// Subscribe `subscriber` (a local service) to `publisher`'s `table`.
    ///
    /// Idempotent. A new subscription triggers a one-time snapshot of the
    /// publisher's current table, delivered asynchronously. When the
    /// publisher is not registered anywhere yet, the subscription is kept and
    /// the snapshot is requested as soon as the publisher appears. A snapshot
    /// request the channel cannot deliver is deferred the same way.
    ///
    /// # Errors
    ///
    /// - [`DseError::NotFound`] when `subscriber` is not registered here
    /// - [`DseError::Channel`] when the channel refuses the subscription
    /// - [`DseError::Closed`] after [`stop`](Self::stop)
    pub async fn subscribe(&self, subscriber: &str, publisher: &str, table: &str) -> DseResult<()> {
        self.ensure_running()?;
        if !self.inner.services.contains_key(subscriber) {
            return Err(DseError::NotFound(format!("service {subscriber}")));
        }

        if self.inner.subscriptions.subscribe(subscriber, publisher, table)
            == SubscribeOutcome::Existing
        {
            return Ok(());
        }

        if let Err(e) = self
            .inner
            .transport
            .subscribe(&table_topic(publisher, table))
            .await
        {
            self.inner
                .subscriptions
                .unsubscribe(subscriber, publisher, table);
            return Err(e.into());
        }

        debug!("{} subscribed to {}:{}", subscriber, publisher, table);
        match self.request_snapshot(subscriber, publisher, table).await {
            Err(DseError::Closed) => Err(DseError::Closed),
            Err(e) => {
                warn!(
                    "Snapshot of {}:{} for {} deferred until {} reappears: {}",
                    publisher, table, subscriber, publisher, e
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Drop one subscription. Missing subscriptions are ignored and other
    /// tables of the same publisher are untouched.
    ///
    /// # Errors
    ///
    /// Currently infallible; channel failures are logged.
    pub async fn unsubscribe(&self, subscriber: &str, publisher: &str, table: &str) -> DseResult<()> {
        match self
            .inner
            .subscriptions
            .unsubscribe(subscriber, publisher, table)
        {
            UnsubscribeOutcome::Removed { topic_idle } => {
                debug!("{} unsubscribed from {}:{}", subscriber, publisher, table);
                if topic_idle {
                    self.release_topics(vec![(publisher.to_string(), table.to_string())])
                        .await;
                }
            }
            UnsubscribeOutcome::Missing => {}
        }
        Ok(())
    }

    /// Subscriptions held by a local service
    #[must_use]
    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<Subscription> {
        self.inner.subscriptions.subscriptions_of(subscriber)
    }

    async fn request_snapshot(&self, subscriber: &str, publisher: &str, table: &str) -> DseResult<()> {
        match self.route(publisher) {
            Some(Route::Local(_)) => self.enqueue(Job::LocalSnapshot {
                subscriber: subscriber.to_string(),
                publisher: publisher.to_string(),
                table: table.to_string(),
            }),
            Some(Route::Remote(owner)) => {
                let request = DseMessage::SnapshotRequest {
                    subscriber: subscriber.to_string(),
                    publisher: publisher.to_string(),
                    table: table.to_string(),
                };
                self.send(&owner, &request, None).await
            }
            None => {
                debug!(
                    "Publisher {} not registered yet; snapshot of {} deferred",
                    publisher, table
                );
                Ok(())
            }
        }
    }

    async fn release_topics(&self, topics: Vec<(String, String)>) {
        for (publisher, table) in topics {
            if let Err(e) = self
                .inner
                .transport
                .unsubscribe(&table_topic(&publisher, &table))
                .await
            {
                debug!("Could not release topic {}:{}: {}", publisher, table, e);
            }
        }
    }

    // Publishing

    /// Publish a table of a local service: `data` replaces the stored table
    /// when given, otherwise the stored table goes out as is.
    ///
    /// Returns once the snapshot is handed to local queues and the channel;
    /// subscribers see it eventually.
    ///
    /// # Errors
    ///
    /// - [`DseError::NotFound`] when `publisher` is not registered here
    /// - [`DseError::Channel`] when the channel is down as a whole
    pub async fn publish(&self, publisher: &str, table: &str, data: Option<Table>) -> DseResult<()> {
        self.ensure_running()?;
        let hosted = self
            .local(publisher)
            .ok_or_else(|| DseError::NotFound(format!("service {publisher}")))?;
        let publication = hosted.publish(table, data);
        self.fan_out(publisher, vec![publication]).await
    }

    /// Deliver stamped snapshots to every current subscriber, local or
    /// remote. A failure to reach one local subscriber is logged and does
    /// not stop the others.
    pub(crate) async fn fan_out(&self, publisher: &str, publications: Vec<Publication>) -> DseResult<()> {
        for Publication { table, seq, data } in publications {
            for subscriber in self.inner.subscriptions.subscribers(publisher, &table) {
                if let Err(e) = self.enqueue(Job::Deliver {
                    subscriber: subscriber.clone(),
                    publisher: publisher.to_string(),
                    table: table.clone(),
                    seq,
                    data: data.clone(),
                }) {
                    warn!("Could not queue {}:{} for {}: {}", publisher, table, subscriber, e);
                }
            }

            let topic = table_topic(publisher, &table);
            let message = DseMessage::Publish {
                publisher: publisher.to_string(),
                table,
                seq,
                data,
            };
            self.inner
                .transport
                .publish(&topic, &message.encode()?, message.message_type())
                .await?;
        }
        Ok(())
    }

    // RPC

    /// Call `method` on the service named `service`, wherever it is hosted.
    ///
    /// Local services are called through this node's dispatcher without
    /// touching the channel; remote ones through a correlated request.
    /// `timeout` defaults to the configured RPC response timeout.
    ///
    /// # Errors
    ///
    /// Exactly one of:
    /// - [`DseError::NotFound`] when the service or method does not exist,
    ///   or the service disappears while the call is in flight
    /// - [`DseError::Timeout`] when no response arrives in time
    /// - [`DseError::Remote`] when the method itself fails
    /// - [`DseError::Closed`] when either side shuts down first
    /// - [`DseError::Channel`] when the request cannot be sent
    pub async fn invoke_service_rpc(
        &self,
        service: &str,
        method: &str,
        args: Vec<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> DseResult<serde_json::Value> {
        self.ensure_running()?;
        let deadline = timeout.unwrap_or(self.inner.config.rpc_response_timeout);
        let target = format!("{service}.{method}");

        match self.route(service) {
            None => Err(DseError::NotFound(format!("service {service}"))),
            Some(Route::Local(_)) => {
                let (reply, response) = oneshot::channel();
                self.enqueue(Job::Rpc {
                    service: service.to_string(),
                    method: method.to_string(),
                    args,
                    reply,
                })?;
                Self::await_outcome(response, &target, deadline).await
            }
            Some(Route::Remote(owner)) => {
                let correlation_id = Uuid::new_v4();
                let response = self.inner.pending.insert(correlation_id, service, &owner);
                if !self.is_running() {
                    self.inner.pending.cancel(correlation_id);
                    return Err(DseError::Closed);
                }

                let request = DseMessage::RpcRequest {
                    service: service.to_string(),
                    method: method.to_string(),
                    args,
                };
                if let Err(e) = self.send(&owner, &request, Some(correlation_id)).await {
                    self.inner.pending.cancel(correlation_id);
                    return Err(e);
                }

                let result = Self::await_outcome(response, &target, deadline).await;
                if matches!(result, Err(DseError::Timeout { .. })) {
                    self.inner.pending.cancel(correlation_id);
                }
                result
            }
        }
    }

    async fn await_outcome(
        response: oneshot::Receiver<RpcOutcome>,
        target: &str,
        deadline: Duration,
    ) -> DseResult<serde_json::Value> {
        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => Err(DseError::Closed),
            Err(_) => Err(DseError::Timeout {
                target: target.to_string(),
                after: deadline,
            }),
        }
    }

    // Channel plumbing

    async fn send(
        &self,
        recipient: &NodeId,
        message: &DseMessage,
        correlation_id: Option<Uuid>,
    ) -> DseResult<()> {
        let payload = message.encode()?;
        self.inner
            .transport
            .send_envelope(recipient, &payload, message.message_type(), correlation_id)
            .await?;
        Ok(())
    }

    async fn broadcast(&self, message: &DseMessage) -> DseResult<()> {
        let payload = message.encode()?;
        self.inner
            .transport
            .publish(
                &self.inner.config.membership_topic,
                &payload,
                message.message_type(),
            )
            .await?;
        Ok(())
    }

    fn enqueue(&self, job: Job) -> DseResult<()> {
        self.ensure_running()?;
        self.inner.jobs.send(job).map_err(|_| DseError::Closed)
    }

    /// Spawn a task that lives until the node stops
    pub(crate) fn spawn_tracked<F>(&self, task: F) -> DseResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_running()?;
        let cancellation = self.inner.cancellation_token.clone();
        self.inner.task_tracker.spawn(async move {
            tokio::select! {
                () = task => {}
                () = cancellation.cancelled() => {}
            }
        });
        Ok(())
    }

    // Background tasks

    fn spawn_router(&self) {
        let node = self.clone();
        let cancellation = self.inner.cancellation_token.clone();

        self.inner.task_tracker.spawn(async move {
            tokio::select! {
                () = node.router_loop() => {
                    debug!("Router loop of {} ended with the transport", node.inner.id);
                }
                () = cancellation.cancelled() => {
                    debug!("Router loop of {} cancelled", node.inner.id);
                }
            }
        });
    }

    fn spawn_dispatcher(&self, job_queue: flume::Receiver<Job>) {
        let node = self.clone();
        let cancellation = self.inner.cancellation_token.clone();

        self.inner.task_tracker.spawn(async move {
            tokio::select! {
                () = node.dispatch_loop(job_queue) => {
                    error!("Dispatch loop of {} exited unexpectedly", node.inner.id);
                }
                () = cancellation.cancelled() => {
                    debug!("Dispatch loop of {} cancelled", node.inner.id);
                }
            }
        });
    }

    async fn router_loop(&self) {
        let mut incoming = self.inner.transport.incoming();
        while let Some(envelope) = incoming.next().await {
            if let Err(e) = self.handle_envelope(envelope).await {
                warn!("Node {} failed to handle envelope: {}", self.inner.id, e);
            }
        }
    }

    async fn handle_envelope(&self, envelope: TransportEnvelope) -> DseResult<()> {
        let TransportEnvelope {
            correlation_id,
            payload,
            sender,
            ..
        } = envelope;
        let message = DseMessage::decode(&payload)?;
        debug!(
            "Node {} received {} from {}",
            self.inner.id,
            message.message_type(),
            sender
        );

        match message {
            DseMessage::Hello => self.on_hello(&sender).await?,
            DseMessage::Announce { services } => {
                let (appeared, vanished) = self.inner.directory.replace_node(&sender, &services);
                for service in vanished {
                    self.on_service_vanished(&service).await;
                }
                for service in appeared {
                    self.on_service_appeared(&sender, &service).await;
                }
            }
            DseMessage::ServiceRegistered { service } => {
                self.inner.directory.insert(&sender, &service);
                self.on_service_appeared(&sender, &service).await;
            }
            DseMessage::ServiceUnregistered { service } => {
                if self.inner.directory.remove(&sender, &service) {
                    self.on_service_vanished(&service).await;
                }
            }
            DseMessage::Goodbye => {
                for service in self.inner.directory.remove_node(&sender) {
                    self.on_service_vanished(&service).await;
                }
                self.inner.pending.fail_node(
                    &sender,
                    &RpcOutcome::NotFound(format!("node {sender} left")),
                );
            }
            DseMessage::Publish {
                publisher,
                table,
                seq,
                data,
            } => {
                for subscriber in self.inner.subscriptions.subscribers(&publisher, &table) {
                    self.enqueue(Job::Deliver {
                        subscriber,
                        publisher: publisher.clone(),
                        table: table.clone(),
                        seq,
                        data: data.clone(),
                    })?;
                }
            }
            DseMessage::Snapshot {
                subscriber,
                publisher,
                table,
                seq,
                data,
            } => self.enqueue(Job::Deliver {
                subscriber,
                publisher,
                table,
                seq,
                data,
            })?,
            DseMessage::SnapshotRequest {
                subscriber,
                publisher,
                table,
            } => self.enqueue(Job::ServeSnapshot {
                requester: sender,
                subscriber,
                publisher,
                table,
            })?,
            DseMessage::RpcRequest {
                service,
                method,
                args,
            } => match correlation_id {
                Some(correlation_id) => self.enqueue(Job::RemoteRpc {
                    caller: sender,
                    correlation_id,
                    service,
                    method,
                    args,
                })?,
                None => warn!("Dropping uncorrelated RPC request from {}", sender),
            },
            DseMessage::RpcResponse(outcome) => match correlation_id {
                Some(correlation_id) => {
                    if !self.inner.pending.complete(correlation_id, outcome) {
                        debug!("Late response {} from {}", correlation_id, sender);
                    }
                }
                None => warn!("Dropping uncorrelated RPC response from {}", sender),
            },
        }

        Ok(())
    }

    async fn on_hello(&self, sender: &NodeId) -> DseResult<()> {
        for service in self.inner.directory.remove_node(sender) {
            self.on_service_vanished(&service).await;
        }
        let services = self.local_service_names().into_iter().collect();
        self.send(sender, &DseMessage::Announce { services }, None)
            .await
    }

    /// Ask a newly discovered publisher for the snapshots local subscribers
    /// are still waiting on
    async fn on_service_appeared(&self, owner: &NodeId, service: &str) {
        for Subscription {
            subscriber,
            publisher,
            table,
        } in self.inner.subscriptions.awaiting_snapshot(service)
        {
            let request = DseMessage::SnapshotRequest {
                subscriber,
                publisher,
                table,
            };
            if let Err(e) = self.send(owner, &request, None).await {
                warn!("Snapshot request to {} failed: {}", owner, e);
            }
        }
    }

    async fn on_service_vanished(&self, service: &str) {
        let failed = self.inner.pending.fail_service(
            service,
            &RpcOutcome::NotFound(format!("service {service}")),
        );
        if failed > 0 {
            debug!("Failed {} requests to vanished service {}", failed, service);
        }

        let dropped = self.inner.subscriptions.remove_publisher(service);
        self.release_topics(dropped).await;
    }

    async fn dispatch_loop(&self, job_queue: flume::Receiver<Job>) {
        while let Ok(job) = job_queue.recv_async().await {
            self.run(job).await;
        }
    }

    async fn run(&self, job: Job) {
        match job {
            Job::Deliver {
                subscriber,
                publisher,
                table,
                seq,
                data,
            } => self.deliver(&subscriber, &publisher, &table, seq, data).await,
            Job::LocalSnapshot {
                subscriber,
                publisher,
                table,
            } => {
                let Some(hosted) = self.local(&publisher) else {
                    debug!("Publisher {} left before its snapshot was taken", publisher);
                    return;
                };
                let Publication { seq, data, .. } = hosted.current(&table);
                self.deliver(&subscriber, &publisher, &table, seq, data).await;
            }
            Job::ServeSnapshot {
                requester,
                subscriber,
                publisher,
                table,
            } => {
                let Some(hosted) = self.local(&publisher) else {
                    debug!("Snapshot requested from absent service {}", publisher);
                    return;
                };
                let Publication { seq, data, .. } = hosted.current(&table);
                let snapshot = DseMessage::Snapshot {
                    subscriber,
                    publisher,
                    table,
                    seq,
                    data,
                };
                if let Err(e) = self.send(&requester, &snapshot, None).await {
                    warn!("Snapshot to {} failed: {}", requester, e);
                }
            }
            Job::Rpc {
                service,
                method,
                args,
                reply,
            } => {
                let outcome = self.call_local(&service, &method, &args).await;
                let _ = reply.send(outcome);
            }
            Job::RemoteRpc {
                caller,
                correlation_id,
                service,
                method,
                args,
            } => {
                let outcome = self.call_local(&service, &method, &args).await;
                if let Err(e) = self
                    .send(&caller, &DseMessage::RpcResponse(outcome), Some(correlation_id))
                    .await
                {
                    warn!("Response to {} failed: {}", caller, e);
                }
            }
        }
    }

    async fn deliver(&self, subscriber: &str, publisher: &str, table: &str, seq: u64, data: Table) {
        if !self
            .inner
            .subscriptions
            .accept(subscriber, publisher, table, seq)
        {
            debug!(
                "Dropping {}:{}#{} for {} (stale or unsubscribed)",
                publisher, table, seq, subscriber
            );
            return;
        }

        let Some(hosted) = self.local(subscriber) else {
            return;
        };

        let publications = hosted.deliver(ReceivedMessage {
            sender: publisher.to_string(),
            table: table.to_string(),
            data,
        });
        if let Err(e) = self.fan_out(subscriber, publications).await {
            warn!("Publishing derived tables of {} failed: {}", subscriber, e);
        }
    }

    async fn call_local(&self, service: &str, method: &str, args: &[serde_json::Value]) -> RpcOutcome {
        let Some(hosted) = self.local(service) else {
            return RpcOutcome::NotFound(format!("service {service}"));
        };

        let (result, publications) = hosted.call(method, args);
        if let Err(e) = self.fan_out(service, publications).await {
            warn!("Publishing tables of {} failed: {}", service, e);
        }

        match result {
            None => RpcOutcome::NotFound(format!("method {method} of service {service}")),
            Some(Ok(value)) => RpcOutcome::Ok(value),
            Some(Err(e)) => RpcOutcome::Failed(e.to_string()),
        }
    }

    /// Number of remote calls still awaiting a response
    #[must_use]
    pub fn pending_rpcs(&self) -> usize {
        self.inner.pending.len()
    }
}
