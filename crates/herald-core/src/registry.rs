//! Topic registry.
//!
//! Maps topic names to the connections subscribed to them. The registry only
//! stores [`ConnectionId`]s; it never keeps a connection alive, and the
//! connection manager removes every reference when a connection closes.

use crate::connection::ConnectionId;
use crate::topic::TopicId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Concurrent topic → subscriber index.
///
/// Both maps are sharded, so a lookup for one topic only contends with
/// writers that happen to hash to the same shard.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    /// Subscribers indexed by topic.
    topics: DashMap<TopicId, HashSet<ConnectionId>>,
    /// Topics indexed by connection, for unsubscribe.
    connections: DashMap<ConnectionId, HashSet<TopicId>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a set of topics.
    ///
    /// Subscribing to a topic the connection already holds is a no-op.
    pub fn subscribe<I>(&self, connection_id: ConnectionId, topics: I)
    where
        I: IntoIterator<Item = TopicId>,
    {
        let mut held = self.connections.entry(connection_id).or_default();

        for topic in topics {
            if !held.insert(topic.clone()) {
                continue;
            }
            let mut subscribers = self.topics.entry(topic.clone()).or_insert_with(|| {
                debug!(topic = %topic, "Creating topic");
                HashSet::new()
            });
            subscribers.insert(connection_id);
            trace!(
                topic = %topic,
                connection = %connection_id,
                subscribers = subscribers.len(),
                "Subscribed"
            );
        }
    }

    /// Remove a connection from every topic it holds.
    ///
    /// Returns `false` if the connection was not registered, which makes a
    /// second call a no-op.
    pub fn unsubscribe(&self, connection_id: ConnectionId) -> bool {
        let Some((_, topics)) = self.connections.remove(&connection_id) else {
            return false;
        };

        for topic in &topics {
            let now_empty = match self.topics.get_mut(topic) {
                Some(mut subscribers) => {
                    subscribers.remove(&connection_id);
                    subscribers.is_empty()
                }
                None => false,
            };

            // A subscriber may have arrived since the guard was released.
            if now_empty
                && self
                    .topics
                    .remove_if(topic, |_, subscribers| subscribers.is_empty())
                    .is_some()
            {
                debug!(topic = %topic, "Deleted empty topic");
            }
        }

        debug!(connection = %connection_id, topics = topics.len(), "Unsubscribed from all topics");
        true
    }

    /// Get the connections subscribed to a topic, in no particular order.
    #[must_use]
    pub fn subscribers_for(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Check if a topic has any subscribers.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<TopicId> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Get the topics a connection is subscribed to.
    #[must_use]
    pub fn connection_topics(&self, connection_id: ConnectionId) -> Vec<TopicId> {
        self.connections
            .get(&connection_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.topics.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|t| t.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Number of subscribed connections.
    pub connection_count: usize,
    /// Total number of (connection, topic) pairs.
    pub total_subscriptions: usize,
}
