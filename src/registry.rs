//! Subscription registry: who subscribed locally, and which broker filter
//! on which connection serves them.
//!
//! Two maps are maintained together. `bindings` maps every local
//! subscription to the connection whose broker-side filter covers it;
//! `active_filters` maps each filter actually subscribed at the broker to
//! its owning connection. A local subscribe only reaches the broker when no
//! active filter is already a superset of its topic, and a broker
//! UNSUBSCRIBE is only issued once no local subscription needs the filter.

use crate::topic::TopicFilter;
use crate::transport::{InboundMessage, QoS};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Callback invoked with each broker-delivered message. Identity (for
/// unsubscribe) is the allocation, mirroring callback-object identity.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// A local subscriber: identity is the (topic, qos, callback) triple, so
/// two subscribers on one filter with different callbacks stay distinct.
#[derive(Clone)]
pub struct LocalSubscription {
    pub topic: String,
    pub qos: QoS,
    pub callback: MessageCallback,
}

impl LocalSubscription {
    pub fn new(topic: impl Into<String>, qos: QoS, callback: MessageCallback) -> Self {
        LocalSubscription {
            topic: topic.into(),
            qos,
            callback,
        }
    }

    fn callback_ptr(&self) -> usize {
        Arc::as_ptr(&self.callback) as *const () as usize
    }
}

impl PartialEq for LocalSubscription {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic
            && self.qos == other.qos
            && Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for LocalSubscription {}

impl std::hash::Hash for LocalSubscription {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.topic.hash(state);
        self.qos.value().hash(state);
        self.callback_ptr().hash(state);
    }
}

impl std::fmt::Debug for LocalSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSubscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("callback", &format_args!("{:p}", Arc::as_ptr(&self.callback)))
            .finish()
    }
}

pub(crate) struct SubscriptionRegistry {
    bindings: HashMap<LocalSubscription, u64>,
    active_filters: HashMap<TopicFilter, u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            bindings: HashMap::new(),
            active_filters: HashMap::new(),
        }
    }

    /// Any broker-side filter covering `topic`, with its owning connection.
    pub fn find_superset_owner(&self, topic: &str) -> Option<(TopicFilter, u64)> {
        let requested = TopicFilter::new(topic);
        self.active_filters
            .iter()
            .find(|(filter, _)| filter.is_superset_of(&requested))
            .map(|(filter, conn)| (filter.clone(), *conn))
    }

    pub fn bind(&mut self, subscription: LocalSubscription, connection_id: u64) {
        self.bindings.insert(subscription, connection_id);
    }

    pub fn remove_binding(&mut self, subscription: &LocalSubscription) {
        self.bindings.remove(subscription);
    }

    /// Remove every binding matching (topic, callback), ignoring qos.
    pub fn remove_bindings(&mut self, topic: &str, callback: &MessageCallback) {
        self.bindings.retain(|sub, _| {
            !(sub.topic == topic && Arc::ptr_eq(&sub.callback, callback))
        });
    }

    pub fn insert_active(&mut self, filter: TopicFilter, connection_id: u64) {
        self.active_filters.insert(filter, connection_id);
    }

    pub fn remove_active(&mut self, filter: &TopicFilter) {
        self.active_filters.remove(filter);
    }

    /// Broker-side filters no remaining local subscription needs.
    pub fn dead_filters(&self) -> Vec<(TopicFilter, u64)> {
        self.active_filters
            .iter()
            .filter(|(filter, _)| {
                !self
                    .bindings
                    .keys()
                    .any(|sub| filter.is_superset_of(&TopicFilter::new(&sub.topic)))
            })
            .map(|(filter, conn)| (filter.clone(), *conn))
            .collect()
    }

    /// After `removed` was unsubscribed at the broker, rebind the local
    /// subscriptions it covered to any remaining superset filter. Handles
    /// the rare overlap reshuffle where a subscription rode a wider filter
    /// on the same connection.
    pub fn rebind_covered(&mut self, removed: &TopicFilter, old_connection: u64) {
        let orphans: Vec<LocalSubscription> = self
            .bindings
            .iter()
            .filter(|(sub, conn)| {
                **conn == old_connection && removed.is_superset_of(&TopicFilter::new(&sub.topic))
            })
            .map(|(sub, _)| sub.clone())
            .collect();
        for subscription in orphans {
            if let Some((_, owner)) = self.find_superset_owner(&subscription.topic) {
                self.bindings.insert(subscription, owner);
            }
        }
    }

    /// Local subscriptions a broker message should fan out to.
    ///
    /// A subscription only matches when it is bound to the connection the
    /// message arrived on; overlapping filters living on different
    /// connections would otherwise deliver the same message twice. When
    /// nothing matches on the arriving connection, the broker routed the
    /// message somewhere unexpected (request/response flows do this) and
    /// every matching subscription is taken instead.
    pub fn fanout_targets(
        &self,
        topic: &str,
        arriving_connection: u64,
    ) -> (Vec<LocalSubscription>, bool) {
        let matching = |sub: &&LocalSubscription| -> bool {
            TopicFilter::new(&sub.topic).matches_topic(topic)
        };

        let exact: Vec<LocalSubscription> = self
            .bindings
            .iter()
            .filter(|(_, conn)| **conn == arriving_connection)
            .map(|(sub, _)| sub)
            .filter(matching)
            .cloned()
            .collect();
        if !exact.is_empty() {
            return (exact, false);
        }

        let fallback: Vec<LocalSubscription> = self
            .bindings
            .keys()
            .filter(matching)
            .cloned()
            .collect();
        (fallback, true)
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn active_filter_count(&self) -> usize {
        self.active_filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.active_filters.is_empty()
    }
}

/// Deliver a message to each target. A panicking callback is logged and
/// must not prevent delivery to the remaining subscribers.
pub(crate) fn deliver(message: &InboundMessage, targets: &[LocalSubscription]) {
    for target in targets {
        let callback = target.callback.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            error!(
                topic = %message.topic,
                subscription = %target.topic,
                "unhandled panic in MQTT message callback"
            );
        }
    }
}
