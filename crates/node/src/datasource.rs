//! Data source services: tables mirrored from an external system.
//!
//! The external system is reached through a [`Driver`]. Each poll asks the
//! driver for the complete current state, compares it table by table with
//! what the service holds, and publishes the full contents of every table
//! that changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{DseError, DseResult};
use crate::method::MethodRegistry;
use crate::service::{Service, ServiceCore, ServiceHandle};
use crate::table::{Table, Tables};

/// Failure reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(String);

impl DriverError {
    /// Create a driver error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Query side of an external system
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Fetch the complete current state of every table the system exposes
    async fn poll(&self) -> Result<Tables, DriverError>;
}

#[derive(Debug, Default)]
struct MemoryDriverState {
    tables: Tables,
    failure: Option<String>,
}

/// Driver backed by tables held in memory.
///
/// Clones share state, so a test can keep one clone and mutate the tables
/// while the service owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryDriverState>>,
}

impl MemoryDriver {
    /// Create a driver with no tables
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one table
    pub fn set_table(&self, name: &str, data: Table) {
        self.state.lock().tables.insert(name.to_string(), data);
    }

    /// Remove one table; the next poll reports it as empty
    pub fn remove_table(&self, name: &str) {
        self.state.lock().tables.remove(name);
    }

    /// Make every poll fail with `message`, or succeed again with `None`
    pub fn fail_with(&self, message: Option<&str>) {
        self.state.lock().failure = message.map(str::to_string);
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn poll(&self) -> Result<Tables, DriverError> {
        let state = self.state.lock();
        match &state.failure {
            Some(message) => Err(DriverError::new(message.clone())),
            None => Ok(state.tables.clone()),
        }
    }
}

/// Service publishing the tables of an external system
#[derive(Debug)]
pub struct DataSourceService<D> {
    core: ServiceCore,
    driver: Arc<D>,
    /// Held from driver fetch to apply so polls land in the order they ran
    poll_lock: Arc<tokio::sync::Mutex<()>>,
    poll_count: u64,
    last_error: Option<String>,
    pending: Vec<String>,
}

impl<D: Driver> DataSourceService<D> {
    /// Create a data source called `name` reading through `driver`
    pub fn new(name: impl Into<String>, driver: D) -> Self {
        Self {
            core: ServiceCore::new(name),
            driver: Arc::new(driver),
            poll_lock: Arc::new(tokio::sync::Mutex::new(())),
            poll_count: 0,
            last_error: None,
            pending: Vec::new(),
        }
    }

    /// The driver
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Number of polls attempted so far
    #[must_use]
    pub const fn poll_count(&self) -> u64 {
        self.poll_count
    }

    /// Error of the most recent poll, if it failed
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Fold one poll result into the stored tables.
    ///
    /// Tables the driver no longer reports become empty. A table seen for the
    /// first time with no rows is left out, since it reads as empty anyway.
    /// Returns the tables whose contents changed; those are queued for
    /// publication.
    fn apply(&mut self, polled: Result<Tables, DriverError>) -> DseResult<Vec<String>> {
        self.poll_count += 1;

        let mut polled = match polled {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Driver of {} failed: {}", self.core.name(), e);
                self.last_error = Some(e.to_string());
                return Err(DseError::Driver(e.to_string()));
            }
        };
        self.last_error = None;

        let mut names: BTreeSet<String> = self.core.tables().keys().cloned().collect();
        names.extend(polled.keys().cloned());

        let changed: Vec<String> = names
            .into_iter()
            .filter(|name| {
                let data = polled.remove(name).unwrap_or_default();
                if data.is_empty() && !self.core.tables().contains_key(name) {
                    return false;
                }
                self.core.set_table(name, data)
            })
            .collect();

        self.pending.extend(changed.iter().cloned());
        Ok(changed)
    }
}

impl<D: Driver> Service for DataSourceService<D> {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    fn take_publications(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    fn register_methods(methods: &mut MethodRegistry<Self>) -> DseResult<()> {
        methods.register("get_poll_status", |service: &mut Self, _args| {
            Ok(json!({
                "poll_count": service.poll_count,
                "last_error": service.last_error,
            }))
        })
    }
}

impl<D: Driver> ServiceHandle<DataSourceService<D>> {
    /// Refresh from the driver and publish every table that changed.
    ///
    /// Returns the names of the published tables; unchanged tables are not
    /// published. Overlapping polls of the same service run one at a time.
    ///
    /// # Errors
    ///
    /// - [`DseError::NotFound`] when the service is not registered
    /// - [`DseError::Driver`] when the driver fails; nothing is published
    pub async fn poll(&self) -> DseResult<Vec<String>> {
        self.ensure_registered()?;
        let (driver, poll_lock) = self.read(|service| {
            (Arc::clone(&service.driver), Arc::clone(&service.poll_lock))
        });
        let _polling = poll_lock.lock().await;
        let polled = driver.poll().await;

        let changed = self.update(move |service| service.apply(polled)).await??;
        if !changed.is_empty() {
            debug!("{} published {:?}", self.name(), changed);
        }
        Ok(changed)
    }

    /// Poll every `interval` until the service is unregistered or the node
    /// stops. Poll failures are logged and polling carries on.
    ///
    /// # Errors
    ///
    /// Fails when the service is not registered or the node is stopped.
    pub fn start_polling(&self, interval: Duration) -> DseResult<()> {
        self.ensure_registered()?;
        info!("{} polling every {:?}", self.name(), interval);

        let handle = self.clone();
        self.node().spawn_tracked(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !handle.is_registered() {
                    debug!("{} unregistered, polling stops", handle.name());
                    break;
                }
                if let Err(e) = handle.poll().await {
                    debug!("Scheduled poll of {} failed: {}", handle.name(), e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table;

    fn source() -> (MemoryDriver, DataSourceService<MemoryDriver>) {
        let driver = MemoryDriver::new();
        (driver.clone(), DataSourceService::new("data", driver))
    }

    #[tokio::test]
    async fn test_only_changed_tables_are_queued() {
        let (driver, mut service) = source();

        driver.set_table("a", table![[1]]);
        driver.set_table("b", table![[2]]);
        let changed = service.apply(driver.poll().await).unwrap();
        assert_eq!(changed, vec!["a".to_string(), "b".to_string()]);

        driver.set_table("b", table![[2], [3]]);
        let changed = service.apply(driver.poll().await).unwrap();
        assert_eq!(changed, vec!["b".to_string()]);

        let changed = service.apply(driver.poll().await).unwrap();
        assert!(changed.is_empty());

        assert_eq!(
            service.take_publications(),
            vec!["a".to_string(), "b".to_string(), "b".to_string()]
        );
        assert!(service.take_publications().is_empty());
        assert_eq!(service.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_vanished_table_becomes_empty() {
        let (driver, mut service) = source();

        driver.set_table("a", table![[1]]);
        service.apply(driver.poll().await).unwrap();

        driver.remove_table("a");
        assert_eq!(
            service.apply(driver.poll().await).unwrap(),
            vec!["a".to_string()]
        );
        assert!(service.snapshot("a").is_empty());
    }

    #[tokio::test]
    async fn test_new_empty_table_is_not_queued() {
        let (driver, mut service) = source();

        driver.set_table("a", Table::new());
        assert!(service.apply(driver.poll().await).unwrap().is_empty());
        assert!(service.take_publications().is_empty());

        driver.set_table("a", table![[1]]);
        assert_eq!(
            service.apply(driver.poll().await).unwrap(),
            vec!["a".to_string()]
        );
        driver.set_table("a", Table::new());
        assert_eq!(
            service.apply(driver.poll().await).unwrap(),
            vec!["a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_driver_failure_is_recorded() {
        let (driver, mut service) = source();
        driver.set_table("a", table![[1]]);
        driver.fail_with(Some("connection refused"));

        let result = service.apply(driver.poll().await);
        assert!(matches!(result, Err(DseError::Driver(message)) if message == "connection refused"));
        assert_eq!(service.last_error(), Some("connection refused"));
        assert!(service.take_publications().is_empty());
        assert!(service.snapshot("a").is_empty());

        driver.fail_with(None);
        service.apply(driver.poll().await).unwrap();
        assert_eq!(service.last_error(), None);
        assert_eq!(service.snapshot("a"), table![[1]]);
    }
}
