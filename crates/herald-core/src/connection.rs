//! Subscriber connections.
//!
//! The [`ConnectionManager`] owns every live connection and its bounded
//! outbound queue. Callers get a [`ConnectionHandle`], which is the reading
//! end of the queue; dropping it closes the connection and removes it from
//! the [`TopicRegistry`].
//!
//! Enqueueing never waits. When a queue is full the configured
//! [`OverflowPolicy`] decides which event is lost, and the loss is counted.

use crate::registry::TopicRegistry;
use crate::topic::{validate_topic_name, TopicId};
use dashmap::DashMap;
use herald_protocol::Event;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

/// Opaque connection identifier issued by the [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a connection ID from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// What to give up when a connection's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room; readers converge on the latest state.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

/// Lifecycle of a subscriber connection.
///
/// A handle only exists once its token has been accepted, so connections
/// start in `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and receiving events.
    Streaming,
    /// Terminal. Queue released and registry entries removed.
    Closed,
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// No topics requested.
    #[error("No topics requested")]
    NoTopics,

    /// Too many topics for one connection.
    #[error("Too many topics: {requested} (max {max})")]
    TooManyTopics {
        /// Topics requested.
        requested: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Maximum connections reached.
    #[error("Maximum connections reached")]
    TooManyConnections,
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// What to drop when a queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Maximum topics per connection.
    pub max_topics: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            max_connections: 100_000,
            max_topics: 100,
        }
    }
}

/// Result of pushing onto a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Queued,
    Dropped,
    Closed,
}

/// Bounded FIFO with a wake-up signal for its single reader.
#[derive(Debug)]
struct Outbound {
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbound {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Arc<Event>) -> Push {
        let outcome = {
            let mut queue = self.queue.lock();
            if self.is_closed() {
                return Push::Closed;
            }
            if queue.len() < self.capacity {
                queue.push_back(event);
                Push::Queued
            } else {
                if self.policy == OverflowPolicy::DropOldest {
                    queue.pop_front();
                    queue.push_back(event);
                }
                Push::Dropped
            }
        };

        if outcome == Push::Dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Stores a permit when the reader is not parked yet.
        self.notify.notify_one();
        outcome
    }

    fn pop(&self) -> Option<Arc<Event>> {
        self.queue.lock().pop_front()
    }

    /// Returns `true` for the call that actually closed the queue.
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.queue.lock().clear();
            self.notify.notify_one();
        }
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Everything the manager owns for one connection.
#[derive(Debug)]
struct ConnectionSlot {
    id: ConnectionId,
    topics: Vec<TopicId>,
    outbound: Outbound,
    opened_at: Instant,
}

/// Owns all live subscriber connections.
#[derive(Debug)]
pub struct ConnectionManager {
    /// Live connections indexed by ID.
    connections: DashMap<ConnectionId, Arc<ConnectionSlot>>,
    /// Topic index shared with the dispatcher.
    registry: Arc<TopicRegistry>,
    /// Slots reserved against `max_connections`.
    reserved: AtomicUsize,
    /// Next connection ID.
    next_id: AtomicU64,
    /// Events lost to full queues, across all connections.
    dropped: AtomicU64,
    /// Configuration.
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// Create a manager with default configuration.
    #[must_use]
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self::with_config(registry, ConnectionConfig::default())
    }

    /// Create a manager with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<TopicRegistry>, config: ConnectionConfig) -> Self {
        info!("Creating connection manager with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            registry,
            reserved: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Get the registry this manager keeps in sync.
    #[must_use]
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a connection subscribed to `topics`.
    ///
    /// Duplicate topics are collapsed. The connection is registered before
    /// this returns, so events dispatched afterwards reach it.
    ///
    /// # Errors
    ///
    /// Returns an error if no topics are given, a topic name is invalid, or
    /// a limit is exceeded. Nothing is allocated on error.
    pub fn accept<I, S>(self: &Arc<Self>, topics: I) -> Result<ConnectionHandle, ConnectionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<TopicId>,
    {
        let topics: BTreeSet<TopicId> = topics.into_iter().map(Into::into).collect();

        if topics.is_empty() {
            return Err(ConnectionError::NoTopics);
        }
        if topics.len() > self.config.max_topics {
            return Err(ConnectionError::TooManyTopics {
                requested: topics.len(),
                max: self.config.max_topics,
            });
        }
        for topic in &topics {
            validate_topic_name(topic).map_err(ConnectionError::InvalidTopic)?;
        }
        let max = self.config.max_connections;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| ConnectionError::TooManyConnections)?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ConnectionSlot {
            id,
            topics: topics.into_iter().collect(),
            outbound: Outbound::new(self.config.queue_capacity, self.config.overflow_policy),
            opened_at: Instant::now(),
        });

        // Slot first: the registry must never name an ID the manager doesn't know.
        self.connections.insert(id, Arc::clone(&slot));
        self.registry.subscribe(id, slot.topics.iter().cloned());

        debug!(connection = %id, topics = ?slot.topics, "Connection accepted");

        Ok(ConnectionHandle {
            manager: Arc::clone(self),
            slot,
        })
    }

    /// Queue an event for one connection without waiting.
    ///
    /// Returns `false` if the connection is gone or its queue was full (in
    /// which case an event was dropped per the overflow policy).
    pub fn enqueue(&self, id: ConnectionId, event: Arc<Event>) -> bool {
        let Some(slot) = self.connections.get(&id).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        match slot.outbound.push(event) {
            Push::Queued => true,
            Push::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(connection = %id, policy = ?self.config.overflow_policy, "Queue full, dropped event");
                false
            }
            Push::Closed => false,
        }
    }

    /// Close a connection, releasing its queue and registry entries.
    ///
    /// Returns `true` for the call that closed it; later calls are no-ops.
    pub fn close(&self, id: ConnectionId) -> bool {
        let Some((_, slot)) = self.connections.remove(&id) else {
            return false;
        };

        slot.outbound.close();
        self.registry.unsubscribe(id);
        self.reserved.fetch_sub(1, Ordering::AcqRel);

        debug!(
            connection = %id,
            dropped = slot.outbound.dropped.load(Ordering::Relaxed),
            duration_ms = u64::try_from(slot.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Connection closed"
        );
        true
    }

    /// Close every connection. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }

    /// Check if a connection is open.
    #[must_use]
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Get the number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get connection statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.connections.len(),
            queued: self.connections.iter().map(|e| e.outbound.len()).sum(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Connection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Open connections.
    pub active: usize,
    /// Events waiting in queues.
    pub queued: usize,
    /// Events dropped by overflow since start.
    pub dropped: u64,
}

/// The reading end of one connection.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
    slot: Arc<ConnectionSlot>,
}

impl ConnectionHandle {
    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.slot.id
    }

    /// Get the subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> &[TopicId] {
        &self.slot.topics
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.slot.outbound.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Streaming
        }
    }

    /// How long the connection has been open.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.slot.opened_at.elapsed()
    }

    /// Events this connection lost to overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.slot.outbound.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        let outbound = &self.slot.outbound;
        loop {
            if outbound.is_closed() {
                return None;
            }
            if let Some(event) = outbound.pop() {
                return Some(event);
            }
            outbound.notify.notified().await;
        }
    }

    /// Take the next event if one is queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<Arc<Event>> {
        if self.slot.outbound.is_closed() {
            return None;
        }
        self.slot.outbound.pop()
    }

    /// Close the connection now instead of on drop.
    pub fn close(&self) {
        self.manager.close(self.slot.id);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.manager.close(self.slot.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: ConnectionConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::with_config(
            Arc::new(TopicRegistry::new()),
            config,
        ))
    }

    fn numbered(n: usize) -> Arc<Event> {
        Arc::new(Event::new("todo", "todo-update", n.to_string()))
    }

    fn drain(handle: &ConnectionHandle) -> Vec<String> {
        std::iter::from_fn(|| handle.try_recv())
            .map(|e| e.data.clone())
            .collect()
    }

    #[test]
    fn test_accept_registers_topics() {
        let manager = manager(ConnectionConfig::default());
        let handle = manager.accept(["todo", "other", "todo"]).unwrap();

        assert_eq!(handle.topics(), ["other".to_string(), "todo".to_string()]);
        assert_eq!(handle.state(), ConnectionState::Streaming);
        assert_eq!(manager.registry().subscribers_for("todo"), vec![handle.id()]);
        assert_eq!(manager.connection_count(), 1);
    }

    #[test]
    fn test_accept_rejects_bad_topics() {
        let manager = manager(ConnectionConfig {
            max_topics: 2,
            ..Default::default()
        });

        assert!(matches!(
            manager.accept(Vec::<String>::new()),
            Err(ConnectionError::NoTopics)
        ));
        assert!(matches!(
            manager.accept([""]),
            Err(ConnectionError::InvalidTopic(_))
        ));
        assert!(matches!(
            manager.accept(["a", "b", "c"]),
            Err(ConnectionError::TooManyTopics { requested: 3, max: 2 })
        ));
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.registry().stats().topic_count, 0);
    }

    #[test]
    fn test_max_connections() {
        let manager = manager(ConnectionConfig {
            max_connections: 1,
            ..Default::default()
        });

        let first = manager.accept(["todo"]).unwrap();
        assert!(matches!(
            manager.accept(["todo"]),
            Err(ConnectionError::TooManyConnections)
        ));

        drop(first);
        assert!(manager.accept(["todo"]).is_ok());
    }

    #[test]
    fn test_max_connections_under_contention() {
        let manager = manager(ConnectionConfig {
            max_connections: 100,
            ..Default::default()
        });

        let handles: Vec<ConnectionHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    scope.spawn(move || {
                        (0..50)
                            .filter_map(|_| manager.accept(["todo"]).ok())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        assert_eq!(handles.len(), 100);
        assert_eq!(manager.connection_count(), 100);

        drop(handles);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.accept(["todo"]).is_ok());
    }

    #[test]
    fn test_fifo_order() {
        let manager = manager(ConnectionConfig::default());
        let handle = manager.accept(["todo"]).unwrap();

        for i in 1..=3 {
            assert!(manager.enqueue(handle.id(), numbered(i)));
        }

        assert_eq!(drain(&handle), ["1", "2", "3"]);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let manager = manager(ConnectionConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropOldest,
            ..Default::default()
        });
        let handle = manager.accept(["todo"]).unwrap();

        assert!(manager.enqueue(handle.id(), numbered(1)));
        assert!(manager.enqueue(handle.id(), numbered(2)));
        assert!(!manager.enqueue(handle.id(), numbered(3)));

        assert_eq!(drain(&handle), ["2", "3"]);
        assert_eq!(handle.dropped(), 1);
        assert_eq!(manager.stats().dropped, 1);
    }

    #[test]
    fn test_drop_newest_keeps_earliest() {
        let manager = manager(ConnectionConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropNewest,
            ..Default::default()
        });
        let handle = manager.accept(["todo"]).unwrap();

        for i in 1..=3 {
            manager.enqueue(handle.id(), numbered(i));
        }

        assert_eq!(drain(&handle), ["1", "2"]);
        assert_eq!(handle.dropped(), 1);
    }

    #[test]
    fn test_close_is_exactly_once() {
        let manager = manager(ConnectionConfig::default());
        let handle = manager.accept(["todo"]).unwrap();
        let id = handle.id();

        assert!(manager.close(id));
        assert!(!manager.close(id));
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(!manager.is_open(id));
        assert!(!manager.registry().topic_exists("todo"));

        // Dropping the handle afterwards must not disturb anything.
        drop(handle);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_enqueue_after_close() {
        let manager = manager(ConnectionConfig::default());
        let handle = manager.accept(["todo"]).unwrap();
        let id = handle.id();
        drop(handle);

        assert!(!manager.enqueue(id, numbered(1)));
        assert!(!manager.enqueue(ConnectionId::new(9_999), numbered(1)));
    }

    #[test]
    fn test_close_all() {
        let manager = manager(ConnectionConfig::default());
        let a = manager.accept(["a"]).unwrap();
        let b = manager.accept(["b"]).unwrap();

        assert_eq!(manager.close_all(), 2);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert_eq!(manager.registry().stats().topic_count, 0);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(255).to_string(), "conn_ff");
    }

    #[tokio::test]
    async fn test_recv_wakes_on_enqueue() {
        let manager = manager(ConnectionConfig::default());
        let handle = manager.accept(["todo"]).unwrap();
        let id = handle.id();

        let reader = tokio::spawn(async move { handle.recv().await.map(|e| e.data.clone()) });
        tokio::task::yield_now().await;

        assert!(manager.enqueue(id, numbered(42)));
        assert_eq!(reader.await.unwrap(), Some("42".to_string()));
    }

    #[tokio::test]
    async fn test_recv_ends_on_close() {
        let manager = manager(ConnectionConfig::default());
        let handle = Arc::new(manager.accept(["todo"]).unwrap());

        let reader = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.recv().await })
        };
        tokio::task::yield_now().await;

        handle.close();
        assert!(reader.await.unwrap().is_none());
    }
}
