//! Per-service RPC method registry

use std::collections::BTreeMap;
use std::fmt;

use serde_json::json;
use thiserror::Error;

use crate::error::{DseError, DseResult};
use crate::service::Service;
use crate::table::table_to_json;

/// Error raised by an RPC method, re-raised to the caller as
/// [`DseError::Remote`]
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MethodError(String);

impl MethodError {
    /// Create a method error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result returned by an RPC method
pub type MethodResult = Result<serde_json::Value, MethodError>;

type MethodFn<S> = Box<dyn Fn(&mut S, &[serde_json::Value]) -> MethodResult + Send + Sync>;

/// Fetch positional string argument `index`
///
/// # Errors
///
/// Fails when the argument is missing or not a string.
pub fn arg_str<'a>(args: &'a [serde_json::Value], index: usize) -> Result<&'a str, MethodError> {
    args.get(index)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| MethodError::new(format!("argument {index} must be a string")))
}

/// Method name to callable for one service type.
///
/// Every registry starts with `get_status`, `get_tables` and
/// `get_snapshot(table)`.
pub struct MethodRegistry<S> {
    methods: BTreeMap<String, MethodFn<S>>,
}

impl<S> fmt::Debug for MethodRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: Service> MethodRegistry<S> {
    pub(crate) fn with_builtins() -> Self {
        let mut methods: BTreeMap<String, MethodFn<S>> = BTreeMap::new();

        methods.insert(
            "get_status".to_string(),
            Box::new(|service: &mut S, _args: &[serde_json::Value]| {
                let core = service.core();
                Ok(json!({
                    "name": core.name(),
                    "tables": core.tables().keys().collect::<Vec<_>>(),
                    "last_message": core.last_message().map(|message| json!({
                        "sender": message.sender,
                        "table": message.table,
                    })),
                }))
            }),
        );
        methods.insert(
            "get_tables".to_string(),
            Box::new(|service: &mut S, _args: &[serde_json::Value]| {
                Ok(json!(service.core().tables().keys().collect::<Vec<_>>()))
            }),
        );
        methods.insert(
            "get_snapshot".to_string(),
            Box::new(|service: &mut S, args: &[serde_json::Value]| {
                let table = arg_str(args, 0)?;
                Ok(table_to_json(&service.snapshot(table)))
            }),
        );

        Self { methods }
    }

    /// Register a method.
    ///
    /// # Errors
    ///
    /// Fails with [`DseError::DuplicateName`] when the name is taken.
    pub fn register<F>(&mut self, name: &str, method: F) -> DseResult<()>
    where
        F: Fn(&mut S, &[serde_json::Value]) -> MethodResult + Send + Sync + 'static,
    {
        if self.methods.contains_key(name) {
            return Err(DseError::DuplicateName(format!("method {name}")));
        }
        self.methods.insert(name.to_string(), Box::new(method));
        Ok(())
    }

    /// Whether a method exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Invoke a method; `None` when no such method exists
    pub(crate) fn call(
        &self,
        service: &mut S,
        name: &str,
        args: &[serde_json::Value],
    ) -> Option<MethodResult> {
        self.methods.get(name).map(|method| method(service, args))
    }
}
