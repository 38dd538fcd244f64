//! Service base contract.
//!
//! A service is created on its own, then handed to [`Node::register_service`],
//! which takes ownership of it and returns a typed [`ServiceHandle`]. Every
//! later interaction (publishing, subscribing, reading state, variant
//! specific operations) goes through the handle, so the node stays the only
//! owner of the service's state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DseError, DseResult};
use crate::method::{MethodRegistry, MethodResult};
use crate::node::Node;
use crate::subscriptions::Subscription;
use crate::table::{Table, Tables};

/// A snapshot delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Publishing service
    pub sender: String,
    /// Table the snapshot belongs to
    pub table: String,
    /// Complete contents of the table
    pub data: Table,
}

/// State every service carries: its name, its tables, and the last message
/// it received
#[derive(Debug, Clone, Default)]
pub struct ServiceCore {
    name: String,
    tables: Tables,
    last_message: Option<ReceivedMessage>,
}

impl ServiceCore {
    /// Create an empty core for a service called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Tables::new(),
            last_message: None,
        }
    }

    /// Service name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All tables
    #[must_use]
    pub const fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Contents of one table; unknown tables are empty
    #[must_use]
    pub fn table(&self, name: &str) -> Table {
        self.tables.get(name).cloned().unwrap_or_default()
    }

    /// Replace a table, returning whether its contents changed
    pub fn set_table(&mut self, name: &str, data: Table) -> bool {
        if self.tables.get(name) == Some(&data) {
            return false;
        }
        self.tables.insert(name.to_string(), data);
        true
    }

    /// Most recent message received, if any
    #[must_use]
    pub const fn last_message(&self) -> Option<&ReceivedMessage> {
        self.last_message.as_ref()
    }

    /// Remember `message` as the most recent one
    pub fn record(&mut self, message: ReceivedMessage) {
        self.last_message = Some(message);
    }
}

/// A named unit holding table state, publishing it and answering RPCs
pub trait Service: Send + Sized + 'static {
    /// Shared service state
    fn core(&self) -> &ServiceCore;

    /// Shared service state, mutably
    fn core_mut(&mut self) -> &mut ServiceCore;

    /// Service name
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Current contents of `table`, as published to subscribers
    fn snapshot(&self, table: &str) -> Table {
        self.core().table(table)
    }

    /// Store an explicitly published table
    fn store(&mut self, table: &str, data: Table) {
        self.core_mut().set_table(table, data);
    }

    /// Handle a snapshot from a publisher this service subscribes to
    fn receive(&mut self, message: ReceivedMessage) {
        self.core_mut().record(message);
    }

    /// Tables changed since the last call that should be published
    fn take_publications(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Add service-specific RPC methods
    ///
    /// # Errors
    ///
    /// Fails when a method name is already taken.
    fn register_methods(methods: &mut MethodRegistry<Self>) -> DseResult<()> {
        let _ = methods;
        Ok(())
    }
}

/// A table snapshot ready to go out, stamped with its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Publication {
    pub(crate) table: String,
    pub(crate) seq: u64,
    pub(crate) data: Table,
}

/// A service plus the per-table sequence numbers of its publications.
///
/// Both live under one lock so that reading a snapshot and its sequence
/// number is atomic with respect to publishing.
pub(crate) struct ServiceSlot<S> {
    service: S,
    sequences: HashMap<String, u64>,
}

impl<S: Service> ServiceSlot<S> {
    fn new(service: S) -> Self {
        Self {
            service,
            sequences: HashMap::new(),
        }
    }

    fn current(&self, table: &str) -> Publication {
        Publication {
            table: table.to_string(),
            seq: self.sequences.get(table).copied().unwrap_or(0),
            data: self.service.snapshot(table),
        }
    }

    fn stamp(&mut self, table: &str) -> Publication {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        Publication {
            table: table.to_string(),
            seq: *seq,
            data: self.service.snapshot(table),
        }
    }

    fn stamp_with(&mut self, table: &str, data: Table) -> Publication {
        self.service.store(table, data);
        self.stamp(table)
    }

    fn drain(&mut self) -> Vec<Publication> {
        let mut tables = self.service.take_publications();
        tables.sort();
        tables.dedup();
        tables.iter().map(|table| self.stamp(table)).collect()
    }
}

/// Identity of a slot, used to tell a re-registered service of the same
/// name apart from the original
fn slot_id<S>(slot: &Arc<Mutex<ServiceSlot<S>>>) -> usize {
    Arc::as_ptr(slot).cast::<()>() as usize
}

/// Type-erased view of a registered service used by the dispatch path
pub(crate) trait HostedService: Send + Sync {
    fn current(&self, table: &str) -> Publication;

    fn publish(&self, table: &str, data: Option<Table>) -> Publication;

    fn deliver(&self, message: ReceivedMessage) -> Vec<Publication>;

    fn call(
        &self,
        method: &str,
        args: &[serde_json::Value],
    ) -> (Option<MethodResult>, Vec<Publication>);

    fn slot_id(&self) -> usize;
}

pub(crate) struct Hosted<S> {
    slot: Arc<Mutex<ServiceSlot<S>>>,
    methods: MethodRegistry<S>,
    notify: Arc<Notify>,
}

impl<S: Service> Hosted<S> {
    pub(crate) fn new(service: S, methods: MethodRegistry<S>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(ServiceSlot::new(service))),
            methods,
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn handle(&self, name: String, node: Node) -> ServiceHandle<S> {
        ServiceHandle {
            name,
            slot: Arc::clone(&self.slot),
            notify: Arc::clone(&self.notify),
            node,
        }
    }
}

impl<S: Service> HostedService for Hosted<S> {
    fn current(&self, table: &str) -> Publication {
        self.slot.lock().current(table)
    }

    fn publish(&self, table: &str, data: Option<Table>) -> Publication {
        let mut slot = self.slot.lock();
        match data {
            Some(data) => slot.stamp_with(table, data),
            None => slot.stamp(table),
        }
    }

    fn deliver(&self, message: ReceivedMessage) -> Vec<Publication> {
        let publications = {
            let mut slot = self.slot.lock();
            slot.service.receive(message);
            slot.drain()
        };
        self.notify.notify_waiters();
        publications
    }

    fn call(
        &self,
        method: &str,
        args: &[serde_json::Value],
    ) -> (Option<MethodResult>, Vec<Publication>) {
        let mut slot = self.slot.lock();
        let result = self.methods.call(&mut slot.service, method, args);
        (result, slot.drain())
    }

    fn slot_id(&self) -> usize {
        slot_id(&self.slot)
    }
}

/// Typed handle to a registered service.
///
/// Cheap to clone. Stays usable after the service is unregistered, but
/// operations that need the node then fail with [`DseError::NotFound`].
pub struct ServiceHandle<S> {
    name: String,
    slot: Arc<Mutex<ServiceSlot<S>>>,
    notify: Arc<Notify>,
    node: Node,
}

impl<S> Clone for ServiceHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            slot: Arc::clone(&self.slot),
            notify: Arc::clone(&self.notify),
            node: self.node.clone(),
        }
    }
}

impl<S> fmt::Debug for ServiceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("node", self.node.id())
            .finish_non_exhaustive()
    }
}

impl<S: Service> ServiceHandle<S> {
    /// Service name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node the service was registered on
    #[must_use]
    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Whether this very service is still registered on its node
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.node.hosts(&self.name, slot_id(&self.slot))
    }

    pub(crate) fn ensure_registered(&self) -> DseResult<()> {
        self.node.ensure_running()?;
        if self.is_registered() {
            Ok(())
        } else {
            Err(DseError::NotFound(format!("service {}", self.name)))
        }
    }

    /// Subscribe this service to `publisher`'s `table`
    ///
    /// # Errors
    ///
    /// Fails when the service is no longer registered or the node is stopped.
    pub async fn subscribe(&self, publisher: &str, table: &str) -> DseResult<()> {
        self.ensure_registered()?;
        self.node.subscribe(&self.name, publisher, table).await
    }

    /// Drop this service's subscription to `publisher`'s `table`
    ///
    /// # Errors
    ///
    /// Never fails today; reserved for channel failures.
    pub async fn unsubscribe(&self, publisher: &str, table: &str) -> DseResult<()> {
        self.node.unsubscribe(&self.name, publisher, table).await
    }

    /// Store `data` as `table` and publish it to every subscriber
    ///
    /// # Errors
    ///
    /// Fails with [`DseError::NotFound`] when the service is not registered
    /// and with [`DseError::Closed`] once its node has stopped.
    pub async fn publish(&self, table: &str, data: Table) -> DseResult<()> {
        self.ensure_registered()?;
        let publication = self.slot.lock().stamp_with(table, data);
        self.node.fan_out(&self.name, vec![publication]).await
    }

    /// Publish the stored contents of `table`
    ///
    /// # Errors
    ///
    /// Fails with [`DseError::NotFound`] when the service is not registered.
    pub async fn publish_state(&self, table: &str) -> DseResult<()> {
        self.ensure_registered()?;
        let publication = self.slot.lock().stamp(table);
        self.node.fan_out(&self.name, vec![publication]).await
    }

    /// Run an operation against the service under its lock, then publish
    /// every table the service reports through
    /// [`Service::take_publications`].
    ///
    /// # Errors
    ///
    /// Fails with [`DseError::NotFound`] when the service is not registered.
    pub async fn update<F, R>(&self, operation: F) -> DseResult<R>
    where
        F: FnOnce(&mut S) -> R + Send,
        R: Send,
    {
        self.ensure_registered()?;
        let (result, publications) = {
            let mut slot = self.slot.lock();
            let result = operation(&mut slot.service);
            (result, slot.drain())
        };
        self.node.fan_out(&self.name, publications).await?;
        Ok(result)
    }

    /// Read the service's state
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&S) -> R,
    {
        f(&self.slot.lock().service)
    }

    /// Most recent message delivered to the service
    #[must_use]
    pub fn last_message(&self) -> Option<ReceivedMessage> {
        self.slot.lock().service.core().last_message().cloned()
    }

    /// Wait up to `timeout` for the service to have received something
    pub async fn wait_for_message(&self, timeout: Duration) -> Option<ReceivedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.last_message() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.last_message();
            }
        }
    }

    /// Subscriptions this service currently holds
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.node.subscriptions_of(&self.name)
    }
}
