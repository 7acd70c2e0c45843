//! Shared fixtures for the Herald benchmarks.

use herald_core::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, Event, EventDispatcher, TopicRegistry,
};
use std::sync::Arc;

/// A registry, manager and dispatcher wired together.
pub struct Fixture {
    /// Owns the benchmark's connections.
    pub connections: Arc<ConnectionManager>,
    /// Fans events out to them.
    pub dispatcher: EventDispatcher,
}

impl Fixture {
    /// Build a fixture whose connections use `queue_capacity`.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let connections = Arc::new(ConnectionManager::with_config(
            Arc::clone(&registry),
            ConnectionConfig {
                queue_capacity,
                ..Default::default()
            },
        ));
        let dispatcher = EventDispatcher::new(registry, Arc::clone(&connections));
        Self {
            connections,
            dispatcher,
        }
    }

    /// Open `count` connections subscribed to `topic`.
    ///
    /// # Panics
    ///
    /// Panics if the manager refuses a connection.
    #[must_use]
    pub fn subscribers(&self, count: usize, topic: &str) -> Vec<ConnectionHandle> {
        (0..count)
            .map(|_| self.connections.accept([topic]).expect("accept"))
            .collect()
    }
}

/// An event on `topic` carrying `size` bytes of data.
#[must_use]
pub fn event(topic: &str, size: usize) -> Event {
    Event::new(topic, "bench", "x".repeat(size))
}
