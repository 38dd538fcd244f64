//! Table-shaped state exchanged between services.
//!
//! A table is a set of rows and a row is an ordered sequence of scalar
//! values. A row's identity is its full value, so duplicates collapse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar cell value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// String
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(n) => Self::from(*n),
            Value::Str(s) => Self::String(s.clone()),
        }
    }
}

/// One tuple of a table
pub type Row = Vec<Value>;

/// A set of rows
pub type Table = BTreeSet<Row>;

/// Table name to table contents
pub type Tables = BTreeMap<String, Table>;

/// Render a table as a JSON array of arrays
#[must_use]
pub fn table_to_json(table: &Table) -> serde_json::Value {
    serde_json::Value::Array(
        table
            .iter()
            .map(|row| serde_json::Value::Array(row.iter().map(Into::into).collect()))
            .collect(),
    )
}

/// Build a [`Row`] from anything convertible into [`Value`].
///
/// ```
/// let row = dse_node::row![1, "a"];
/// assert_eq!(row.len(), 2);
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Value::from($value)),*]
    };
}

/// Build a [`Table`] from bracketed rows.
///
/// ```
/// let table = dse_node::table![[1, 2], [1, 2], [3, 4]];
/// assert_eq!(table.len(), 2);
/// ```
#[macro_export]
macro_rules! table {
    ($([$($value:expr),* $(,)?]),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut table = $crate::Table::new();
        $(table.insert($crate::row![$($value),*]);)*
        table
    }};
}
