//! Policy engine for the distributed service engine.
//!
//! A [`PolicyEngine`] is a service holding named policies. Each policy is a
//! set of positive Datalog rules evaluated over tables other services publish.
//! Rules arrive pre-parsed as batches of [`PolicyEvent`]s; a batch applies
//! entirely or not at all.
//!
//! ```no_run
//! # async fn demo(node: dse_node::Node) -> Result<(), dse_policy::PolicyError> {
//! use dse_policy::{Atom, PolicyApi, PolicyEngine, PolicyEvent, Rule, Term};
//!
//! let engine = node.register_service(PolicyEngine::new("policy")).await?;
//! engine.create_policy("alpha").await?;
//!
//! // p(x) :- data:fake_table(x)
//! let rule = Rule::new(
//!     Atom::new("p", vec![Term::var("x")]),
//!     vec![Atom::external("data", "fake_table", vec![Term::var("x")])],
//! );
//! engine
//!     .process_policy_update(vec![PolicyEvent::insert(rule).with_target("alpha")])
//!     .await?;
//!
//! let facts = engine.select("alpha", &Atom::new("p", vec![Term::var("x")]))?;
//! # let _ = facts;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod engine;
mod error;
mod eval;
mod rule;

pub use engine::{DEFAULT_POLICY, Policy, PolicyApi, PolicyEngine, SubscriptionChanges};
pub use error::{PolicyError, PolicyResult};
pub use rule::{Atom, EventKind, PolicyEvent, Rule, Term, WILDCARD};
