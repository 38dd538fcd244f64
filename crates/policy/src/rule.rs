//! Pre-parsed rule model.
//!
//! Rules are positive Datalog: a head atom derived from a conjunction of body
//! atoms. A body atom either names a table of the same policy (`p(x)`) or a
//! table published elsewhere (`module:table(x)`), where `module` is a service
//! name or the name of another policy on the same engine.

use std::collections::BTreeSet;
use std::fmt;

use dse_node::Value;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};

/// Variable name matching anything without binding
pub const WILDCARD: &str = "_";

/// An atom argument
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    /// Variable, bound during evaluation
    Var(String),
    /// Constant value
    Const(Value),
}

impl Term {
    /// A variable
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    /// A constant
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Const(value.into())
    }

    /// The wildcard variable
    #[must_use]
    pub fn wildcard() -> Self {
        Self::Var(WILDCARD.to_string())
    }

    fn variable(&self) -> Option<&str> {
        match self {
            Self::Var(name) if name != WILDCARD => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) => f.write_str(name),
            Self::Const(value) => write!(f, "{value}"),
        }
    }
}

/// A predicate applied to arguments
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Atom {
    /// Service or policy owning the table; `None` for the policy's own tables
    pub module: Option<String>,
    /// Table name
    pub table: String,
    /// Arguments, one per column
    pub args: Vec<Term>,
}

impl Atom {
    /// Atom over a table of the same policy
    pub fn new(table: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            module: None,
            table: table.into(),
            args,
        }
    }

    /// Atom over `module:table`
    pub fn external(module: impl Into<String>, table: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            module: Some(module.into()),
            table: table.into(),
            args,
        }
    }

    /// Variables occurring in the atom, wildcards excluded
    #[must_use]
    pub fn variables(&self) -> BTreeSet<&str> {
        self.args.iter().filter_map(Term::variable).collect()
    }

    /// Whether every argument is a constant
    #[must_use]
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(|term| matches!(term, Term::Const(_)))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            write!(f, "{module}:")?;
        }
        write!(f, "{}(", self.table)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// `head :- body`. A rule with an empty body and a ground head is a fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rule {
    /// Derived atom
    pub head: Atom,
    /// Conditions, all of which must hold
    pub body: Vec<Atom>,
}

impl Rule {
    /// Build a rule
    #[must_use]
    pub const fn new(head: Atom, body: Vec<Atom>) -> Self {
        Self { head, body }
    }

    /// Build a fact
    #[must_use]
    pub const fn fact(head: Atom) -> Self {
        Self::new(head, Vec::new())
    }

    /// Whether the rule is a fact
    #[must_use]
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }

    /// Tables of other modules the body reads, as `(module, table)` pairs
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.body.iter().filter_map(|atom| {
            atom.module
                .as_deref()
                .map(|module| (module, atom.table.as_str()))
        })
    }

    /// Reject rules that cannot be evaluated: qualified heads, wildcards in
    /// the head, and head variables not bound by the body.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] or [`PolicyError::UnsafeRule`].
    pub fn check(&self) -> PolicyResult<()> {
        if self.head.module.is_some() {
            return Err(PolicyError::InvalidRule {
                rule: self.to_string(),
                reason: "head must name a table of the policy itself".to_string(),
            });
        }
        if self
            .head
            .args
            .iter()
            .any(|term| matches!(term, Term::Var(name) if name == WILDCARD))
        {
            return Err(PolicyError::InvalidRule {
                rule: self.to_string(),
                reason: "wildcard in head".to_string(),
            });
        }

        let bound: BTreeSet<&str> = self.body.iter().flat_map(Atom::variables).collect();
        if let Some(variable) = self
            .head
            .variables()
            .into_iter()
            .find(|variable| !bound.contains(variable))
        {
            return Err(PolicyError::UnsafeRule {
                rule: self.to_string(),
                variable: variable.to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            f.write_str(" :- ")?;
            for (index, atom) in self.body.iter().enumerate() {
                if index > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{atom}")?;
            }
        }
        Ok(())
    }
}

/// Whether an event adds or removes its rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Add the rule
    Insert,
    /// Remove the rule
    Delete,
}

/// One rule change of a policy update batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvent {
    /// Insert or delete
    pub kind: EventKind,
    /// Rule to add or remove
    pub rule: Rule,
    /// Target policy; the default policy when `None`
    pub target: Option<String>,
}

impl PolicyEvent {
    /// Insert `rule` into the default policy
    #[must_use]
    pub const fn insert(rule: Rule) -> Self {
        Self {
            kind: EventKind::Insert,
            rule,
            target: None,
        }
    }

    /// Delete `rule` from the default policy
    #[must_use]
    pub const fn delete(rule: Rule) -> Self {
        Self {
            kind: EventKind::Delete,
            rule,
            target: None,
        }
    }

    /// Direct the event at `policy`
    #[must_use]
    pub fn with_target(mut self, policy: impl Into<String>) -> Self {
        self.target = Some(policy.into());
        self
    }
}
