//! Per-node subscription bookkeeping

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

/// A (subscriber, publisher, table) triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscription {
    /// Service receiving the table
    pub subscriber: String,
    /// Service owning the table
    pub publisher: String,
    /// Table name
    pub table: String,
}

impl Subscription {
    /// Build a triple
    pub fn new(
        subscriber: impl Into<String>,
        publisher: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            publisher: publisher.into(),
            table: table.into(),
        }
    }
}

/// Result of recording a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The triple is new
    Added,
    /// The triple already existed
    Existing,
}

/// Result of removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The triple was removed; `topic_idle` is set when no subscriber of
    /// its (publisher, table) pair remains on this node
    Removed {
        /// Whether the pair lost its last local subscriber
        topic_idle: bool,
    },
    /// There was nothing to remove
    Missing,
}

type TopicKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    /// (publisher, table) -> subscriber -> sequence number of the last delivery
    by_topic: HashMap<TopicKey, HashMap<String, Option<u64>>>,
    /// subscriber -> (publisher, table) pairs
    by_subscriber: HashMap<String, BTreeSet<TopicKey>>,
}

impl Inner {
    fn remove(&mut self, subscriber: &str, key: &TopicKey) -> UnsubscribeOutcome {
        let Some(subscribers) = self.by_topic.get_mut(key) else {
            return UnsubscribeOutcome::Missing;
        };
        if subscribers.remove(subscriber).is_none() {
            return UnsubscribeOutcome::Missing;
        }

        let topic_idle = subscribers.is_empty();
        if topic_idle {
            self.by_topic.remove(key);
        }

        if let Some(keys) = self.by_subscriber.get_mut(subscriber) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_subscriber.remove(subscriber);
            }
        }

        UnsubscribeOutcome::Removed { topic_idle }
    }
}

/// Tracks which local services subscribe to which (publisher, table) pairs.
///
/// Keeps a forward index for fan-out and a reverse index per subscriber, plus
/// the sequence number of the last snapshot delivered on each triple so stale
/// snapshots can be dropped.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a triple. Recording an existing triple changes nothing.
    pub fn subscribe(&self, subscriber: &str, publisher: &str, table: &str) -> SubscribeOutcome {
        let mut inner = self.inner.write();
        let key = (publisher.to_string(), table.to_string());

        let subscribers = inner.by_topic.entry(key.clone()).or_default();
        if subscribers.contains_key(subscriber) {
            return SubscribeOutcome::Existing;
        }
        subscribers.insert(subscriber.to_string(), None);

        inner
            .by_subscriber
            .entry(subscriber.to_string())
            .or_default()
            .insert(key);

        SubscribeOutcome::Added
    }

    /// Remove a triple. Triples differing in any field are untouched.
    pub fn unsubscribe(&self, subscriber: &str, publisher: &str, table: &str) -> UnsubscribeOutcome {
        self.inner
            .write()
            .remove(subscriber, &(publisher.to_string(), table.to_string()))
    }

    /// Whether the triple exists
    #[must_use]
    pub fn is_subscribed(&self, subscriber: &str, publisher: &str, table: &str) -> bool {
        self.inner
            .read()
            .by_topic
            .get(&(publisher.to_string(), table.to_string()))
            .is_some_and(|subscribers| subscribers.contains_key(subscriber))
    }

    /// Local subscribers of a (publisher, table) pair
    #[must_use]
    pub fn subscribers(&self, publisher: &str, table: &str) -> Vec<String> {
        self.inner
            .read()
            .by_topic
            .get(&(publisher.to_string(), table.to_string()))
            .map(|subscribers| subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscriptions held by one subscriber
    #[must_use]
    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<Subscription> {
        self.inner
            .read()
            .by_subscriber
            .get(subscriber)
            .map(|keys| {
                keys.iter()
                    .map(|(publisher, table)| Subscription::new(subscriber, publisher, table))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscriptions naming `publisher` that have not delivered anything yet
    #[must_use]
    pub fn awaiting_snapshot(&self, publisher: &str) -> Vec<Subscription> {
        self.inner
            .read()
            .by_topic
            .iter()
            .filter(|((p, _), _)| p == publisher)
            .flat_map(|((p, table), subscribers)| {
                subscribers
                    .iter()
                    .filter(|(_, last)| last.is_none())
                    .map(move |(subscriber, _)| Subscription::new(subscriber, p, table))
            })
            .collect()
    }

    /// Decide whether a snapshot with sequence number `seq` may be delivered
    /// on a triple, and remember it if so.
    ///
    /// Returns false when the triple does not exist or when a snapshot at
    /// least as new has already been delivered.
    pub fn accept(&self, subscriber: &str, publisher: &str, table: &str, seq: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(last) = inner
            .by_topic
            .get_mut(&(publisher.to_string(), table.to_string()))
            .and_then(|subscribers| subscribers.get_mut(subscriber))
        else {
            return false;
        };

        match *last {
            Some(previous) if previous >= seq => false,
            _ => {
                *last = Some(seq);
                true
            }
        }
    }

    /// Drop every triple in which `service` is subscriber or publisher.
    ///
    /// Returns the (publisher, table) pairs left without local subscribers.
    pub fn remove_service(&self, service: &str) -> Vec<(String, String)> {
        let mut inner = self.inner.write();
        let mut idle = Vec::new();

        let as_subscriber: Vec<TopicKey> = inner
            .by_subscriber
            .get(service)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in as_subscriber {
            if let UnsubscribeOutcome::Removed { topic_idle: true } = inner.remove(service, &key) {
                idle.push(key);
            }
        }

        idle.extend(Self::drop_publisher(&mut inner, service));
        idle
    }

    /// Drop every triple naming `publisher`, returning the pairs removed
    pub fn remove_publisher(&self, publisher: &str) -> Vec<(String, String)> {
        Self::drop_publisher(&mut self.inner.write(), publisher)
    }

    fn drop_publisher(inner: &mut Inner, publisher: &str) -> Vec<TopicKey> {
        let keys: Vec<TopicKey> = inner
            .by_topic
            .keys()
            .filter(|(p, _)| p == publisher)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(subscribers) = inner.by_topic.remove(key) {
                for subscriber in subscribers.keys() {
                    if let Some(owned) = inner.by_subscriber.get_mut(subscriber) {
                        owned.remove(key);
                        if owned.is_empty() {
                            inner.by_subscriber.remove(subscriber);
                        }
                    }
                }
            }
        }

        keys
    }

    /// Number of triples
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_topic.values().map(HashMap::len).sum()
    }

    /// Whether no triple is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_topic.is_empty()
    }
}
