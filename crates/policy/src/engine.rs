//! Policy engine service.
//!
//! Holds named policies, each a rule set plus the facts it derives. Tables
//! published by other services feed the rules: every `module:table` a rule
//! reads is subscribed to, and each snapshot received replaces that table's
//! extent and re-derives the policies depending on it before the next message
//! is handled. Derived tables are published as `<policy>:<table>`.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dse_node::{
    DseResult, MethodError, MethodRegistry, ReceivedMessage, Service, ServiceCore, ServiceHandle,
    Table, Tables, arg_str, table_to_json,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::eval::{evaluate, unify};
use crate::rule::{Atom, EventKind, PolicyEvent, Rule, Term};

/// Policy receiving rule events that name no target
pub const DEFAULT_POLICY: &str = "classification";

type TableRef = (String, String);

/// A named rule set and the facts it currently derives
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: Vec<Rule>,
    derived: Tables,
}

impl Policy {
    /// Rules in insertion order
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Every derived table
    #[must_use]
    pub const fn derived(&self) -> &Tables {
        &self.derived
    }

    /// One derived table; empty when nothing is derived for it
    #[must_use]
    pub fn facts(&self, table: &str) -> Table {
        self.derived.get(table).cloned().unwrap_or_default()
    }

    fn reads_module(&self, module: &str) -> bool {
        self.rules
            .iter()
            .flat_map(Rule::references)
            .any(|(m, _)| m == module)
    }

    fn reads(&self, module: &str, table: &str) -> bool {
        self.rules
            .iter()
            .flat_map(Rule::references)
            .any(|reference| reference == (module, table))
    }
}

/// Subscriptions an engine has to take up or drop after a change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Newly referenced `(module, table)` pairs
    pub added: Vec<TableRef>,
    /// No longer referenced pairs
    pub removed: Vec<TableRef>,
}

impl SubscriptionChanges {
    /// Whether nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Service evaluating named policies over published tables
#[derive(Debug)]
pub struct PolicyEngine {
    core: ServiceCore,
    policies: BTreeMap<String, Policy>,
    extents: BTreeMap<TableRef, Table>,
    subscribed: BTreeSet<TableRef>,
    pending: Vec<String>,
}

impl PolicyEngine {
    /// Create an engine called `name` holding an empty default policy
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: ServiceCore::new(name),
            policies: BTreeMap::from([(DEFAULT_POLICY.to_string(), Policy::default())]),
            extents: BTreeMap::new(),
            subscribed: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    /// Look up a policy
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Policy names, sorted
    #[must_use]
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }

    /// `(module, table)` pairs the engine is subscribed to
    #[must_use]
    pub const fn subscribed(&self) -> &BTreeSet<TableRef> {
        &self.subscribed
    }

    /// Contents of `module:table` as rules see it: the last snapshot received
    /// from service `module`, together with the facts derived by a local
    /// policy named `module`
    #[must_use]
    pub fn extent(&self, module: &str, table: &str) -> Table {
        let mut extent = self
            .extents
            .get(&(module.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default();
        if let Some(policy) = self.policies.get(module) {
            if let Some(derived) = policy.derived.get(table) {
                extent.extend(derived.iter().cloned());
            }
        }
        extent
    }

    /// Facts matching `query` under `policy`.
    ///
    /// Unqualified queries read the policy's derived tables, qualified ones
    /// the corresponding extent.
    ///
    /// # Errors
    ///
    /// Fails with [`PolicyError::NotFound`] when the policy does not exist.
    pub fn select(&self, policy: &str, query: &Atom) -> PolicyResult<BTreeSet<Atom>> {
        let rules = self
            .policies
            .get(policy)
            .ok_or_else(|| PolicyError::NotFound(policy.to_string()))?;

        let relation = match &query.module {
            Some(module) => self.extent(module, &query.table),
            None => rules.facts(&query.table),
        };

        Ok(relation
            .into_iter()
            .filter(|row| unify(&query.args, row, &mut BTreeMap::new()))
            .map(|row| Atom {
                module: query.module.clone(),
                table: query.table.clone(),
                args: row.into_iter().map(Term::Const).collect(),
            })
            .collect())
    }

    pub(crate) fn create_policy(&mut self, name: &str) -> PolicyResult<SubscriptionChanges> {
        match self.policies.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(PolicyError::DuplicateName(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Policy::default());
            }
        }
        info!("Created policy {} on {}", name, self.core.name());

        let (changes, mut seeds) = self.sync_subscriptions();
        seeds.extend(self.readers_of_module(name));
        self.recompute(seeds);
        Ok(changes)
    }

    pub(crate) fn delete_policy(&mut self, name: &str) -> PolicyResult<SubscriptionChanges> {
        let removed = self
            .policies
            .remove(name)
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))?;
        info!("Deleted policy {} from {}", name, self.core.name());

        // Subscribers see the derived tables emptied
        self.pending
            .extend(removed.derived.keys().map(|table| format!("{name}:{table}")));

        let (changes, mut seeds) = self.sync_subscriptions();
        seeds.extend(self.readers_of_module(name));
        self.recompute(seeds);
        Ok(changes)
    }

    /// Apply a batch of rule events, all or nothing, then re-derive.
    pub(crate) fn apply_events(
        &mut self,
        events: Vec<PolicyEvent>,
    ) -> PolicyResult<SubscriptionChanges> {
        let count = events.len();
        let mut staged: BTreeMap<String, Vec<Rule>> = BTreeMap::new();

        for PolicyEvent { kind, rule, target } in events {
            let target = target.unwrap_or_else(|| DEFAULT_POLICY.to_string());
            let rules = match staged.entry(target.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let policy = self
                        .policies
                        .get(entry.key())
                        .ok_or_else(|| PolicyError::NotFound(entry.key().clone()))?;
                    let current = policy.rules.clone();
                    entry.insert(current)
                }
            };

            match kind {
                EventKind::Insert => {
                    rule.check()?;
                    if !rules.contains(&rule) {
                        rules.push(rule);
                    }
                }
                EventKind::Delete => {
                    let Some(position) = rules.iter().position(|existing| *existing == rule) else {
                        return Err(PolicyError::RuleNotFound {
                            policy: target,
                            rule: rule.to_string(),
                        });
                    };
                    rules.remove(position);
                }
            }
        }

        let mut seeds = BTreeSet::new();
        for (name, rules) in staged {
            if let Some(policy) = self.policies.get_mut(&name) {
                if policy.rules != rules {
                    policy.rules = rules;
                    seeds.insert(name);
                }
            }
        }
        debug!(
            "{} applied {} rule events, {} policies changed",
            self.core.name(),
            count,
            seeds.len()
        );

        let (changes, removed_readers) = self.sync_subscriptions();
        seeds.extend(removed_readers);
        self.recompute(seeds);
        Ok(changes)
    }

    /// Every `(module, table)` some rule reads from another service. A module
    /// named like a local policy is still subscribed to; its extent is merged
    /// with that policy's derived facts.
    fn references(&self) -> BTreeSet<TableRef> {
        self.policies
            .values()
            .flat_map(|policy| policy.rules.iter().flat_map(Rule::references))
            .filter(|(module, _)| *module != self.core.name())
            .map(|(module, table)| (module.to_string(), table.to_string()))
            .collect()
    }

    /// Bring `subscribed` in line with the rules, dropping the extents of
    /// tables no longer read. Returns the changes and the policies that read
    /// a dropped extent.
    fn sync_subscriptions(&mut self) -> (SubscriptionChanges, BTreeSet<String>) {
        let wanted = self.references();
        let added: Vec<TableRef> = wanted.difference(&self.subscribed).cloned().collect();
        let removed: Vec<TableRef> = self.subscribed.difference(&wanted).cloned().collect();

        let mut readers = BTreeSet::new();
        for reference in &removed {
            if self.extents.remove(reference).is_some() {
                readers.extend(self.readers_of(&reference.0, &reference.1));
            }
        }
        self.subscribed = wanted;

        (SubscriptionChanges { added, removed }, readers)
    }

    /// Undo the bookkeeping of subscription changes the node did not carry
    /// out, so the next sync attempts them again.
    fn unsettle(&mut self, failed: SubscriptionChanges) {
        for reference in &failed.added {
            self.subscribed.remove(reference);
        }
        self.subscribed.extend(failed.removed);
    }

    fn readers_of(&self, module: &str, table: &str) -> Vec<String> {
        self.policies
            .iter()
            .filter(|(_, policy)| policy.reads(module, table))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn readers_of_module(&self, module: &str) -> Vec<String> {
        self.policies
            .iter()
            .filter(|(_, policy)| policy.reads_module(module))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `seeds` plus every policy reading, directly or not, one of them
    fn dependents(&self, seeds: BTreeSet<String>) -> BTreeSet<String> {
        let mut affected = seeds;
        loop {
            let before = affected.len();
            let next: Vec<String> = self
                .policies
                .iter()
                .filter(|(name, policy)| {
                    !affected.contains(*name)
                        && affected.iter().any(|seed| policy.reads_module(seed))
                })
                .map(|(name, _)| name.clone())
                .collect();
            affected.extend(next);
            if affected.len() == before {
                return affected;
            }
        }
    }

    /// Re-derive `seeds` and their dependents from scratch, queueing every
    /// derived table whose contents changed for publication.
    fn recompute(&mut self, seeds: BTreeSet<String>) {
        let affected: Vec<String> = self
            .dependents(seeds)
            .into_iter()
            .filter(|name| self.policies.contains_key(name))
            .collect();
        if affected.is_empty() {
            return;
        }

        let previous: BTreeMap<String, Tables> = affected
            .iter()
            .filter_map(|name| {
                self.policies
                    .get_mut(name)
                    .map(|policy| (name.clone(), std::mem::take(&mut policy.derived)))
            })
            .collect();

        // Dependents read each other's derived facts, so iterate until no
        // policy changes any more
        loop {
            let mut changed = false;
            for name in &affected {
                let Some(policy) = self.policies.get(name) else {
                    continue;
                };
                let derived = evaluate(&policy.rules, |module, table| self.extent(module, table));
                if let Some(policy) = self.policies.get_mut(name) {
                    if policy.derived != derived {
                        policy.derived = derived;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for (name, before) in previous {
            let Some(policy) = self.policies.get(&name) else {
                continue;
            };
            let tables: BTreeSet<&String> = before.keys().chain(policy.derived.keys()).collect();
            for table in tables {
                if before.get(table) != policy.derived.get(table) {
                    self.pending.push(format!("{name}:{table}"));
                }
            }
        }
    }
}

impl Service for PolicyEngine {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ServiceCore {
        &mut self.core
    }

    fn snapshot(&self, table: &str) -> Table {
        match table.split_once(':') {
            Some((policy, derived)) => self
                .policies
                .get(policy)
                .map(|policy| policy.facts(derived))
                .unwrap_or_default(),
            None => self.core.table(table),
        }
    }

    fn receive(&mut self, message: ReceivedMessage) {
        let reference = (message.sender.clone(), message.table.clone());
        if self.subscribed.contains(&reference) {
            debug!(
                "{} replacing extent of {}:{} ({} rows)",
                self.core.name(),
                message.sender,
                message.table,
                message.data.len()
            );
            self.extents.insert(reference, message.data.clone());
            let readers = self.readers_of(&message.sender, &message.table);
            self.recompute(readers.into_iter().collect());
        }
        self.core.record(message);
    }

    fn take_publications(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    fn register_methods(methods: &mut MethodRegistry<Self>) -> DseResult<()> {
        methods.register("get_policies", |engine: &mut Self, _args| {
            Ok(json!(engine.policy_names()))
        })?;
        methods.register("get_rules", |engine: &mut Self, args| {
            let name = arg_str(args, 0)?;
            let policy = engine
                .policy(name)
                .ok_or_else(|| MethodError::new(format!("policy '{name}' not found")))?;
            Ok(json!(
                policy
                    .rules()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            ))
        })?;
        methods.register("select", |engine: &mut Self, args| {
            let name = arg_str(args, 0)?;
            let table = arg_str(args, 1)?;
            let policy = engine
                .policy(name)
                .ok_or_else(|| MethodError::new(format!("policy '{name}' not found")))?;
            Ok(table_to_json(&policy.facts(table)))
        })
    }
}

/// Policy operations on a registered engine.
///
/// Every operation runs under the engine's lock, publishes the derived tables
/// it changed, then takes up or drops the subscriptions its rules now need.
/// When the node refuses one of those subscription changes the operation
/// itself has taken effect, the error is returned, and the change is retried
/// by the next operation.
#[async_trait]
pub trait PolicyApi {
    /// Create an empty policy
    ///
    /// # Errors
    ///
    /// Fails with [`PolicyError::DuplicateName`] when the name exists, or
    /// [`PolicyError::Dse`] when a subscription change fails.
    async fn create_policy(&self, name: &str) -> PolicyResult<()>;

    /// Delete a policy, withdrawing its derived tables
    ///
    /// # Errors
    ///
    /// Fails with [`PolicyError::NotFound`] when the policy does not exist, or
    /// [`PolicyError::Dse`] when a subscription change fails.
    async fn delete_policy(&self, name: &str) -> PolicyResult<()>;

    /// Apply a batch of rule events atomically. The affected policies are
    /// re-derived before this returns.
    ///
    /// # Errors
    ///
    /// Fails, changing nothing, when a target policy does not exist, a rule
    /// is unsafe or malformed, or a deleted rule is absent. Fails with
    /// [`PolicyError::Dse`] after applying the batch when a subscription
    /// change fails.
    async fn process_policy_update(&self, events: Vec<PolicyEvent>) -> PolicyResult<()>;

    /// Facts matching `query` under `policy`
    ///
    /// # Errors
    ///
    /// Fails with [`PolicyError::NotFound`] when the policy does not exist.
    fn select(&self, policy: &str, query: &Atom) -> PolicyResult<BTreeSet<Atom>>;

    /// Policy names, sorted
    fn policy_names(&self) -> Vec<String>;
}

async fn follow(
    handle: &ServiceHandle<PolicyEngine>,
    changes: SubscriptionChanges,
) -> PolicyResult<()> {
    let mut failed = SubscriptionChanges::default();
    let mut first_error = None;

    for (module, table) in changes.added {
        if let Err(e) = handle.subscribe(&module, &table).await {
            warn!("{} could not subscribe to {}:{}: {}", handle.name(), module, table, e);
            failed.added.push((module, table));
            first_error.get_or_insert(e);
        }
    }
    for (module, table) in changes.removed {
        if let Err(e) = handle.unsubscribe(&module, &table).await {
            warn!("{} could not unsubscribe from {}:{}: {}", handle.name(), module, table, e);
            failed.removed.push((module, table));
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        None => Ok(()),
        Some(e) => {
            handle.update(move |engine| engine.unsettle(failed)).await?;
            Err(e.into())
        }
    }
}

#[async_trait]
impl PolicyApi for ServiceHandle<PolicyEngine> {
    async fn create_policy(&self, name: &str) -> PolicyResult<()> {
        let name = name.to_string();
        let changes = self.update(move |engine| engine.create_policy(&name)).await??;
        follow(self, changes).await
    }

    async fn delete_policy(&self, name: &str) -> PolicyResult<()> {
        let name = name.to_string();
        let changes = self.update(move |engine| engine.delete_policy(&name)).await??;
        follow(self, changes).await
    }

    async fn process_policy_update(&self, events: Vec<PolicyEvent>) -> PolicyResult<()> {
        let changes = self.update(move |engine| engine.apply_events(events)).await??;
        follow(self, changes).await
    }

    fn select(&self, policy: &str, query: &Atom) -> PolicyResult<BTreeSet<Atom>> {
        self.read(|engine| engine.select(policy, query))
    }

    fn policy_names(&self) -> Vec<String> {
        self.read(PolicyEngine::policy_names)
    }
}
