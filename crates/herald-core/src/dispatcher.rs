//! Event dispatcher.
//!
//! Turns a submitted batch into queue handoffs. Nothing here touches a
//! socket: a slow subscriber only ever fills its own queue.

use crate::connection::ConnectionManager;
use crate::registry::TopicRegistry;
use crate::topic::{validate_event, MalformedEvent};
use herald_protocol::Event;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default maximum event data size (64 KiB).
pub const DEFAULT_MAX_EVENT_DATA_BYTES: usize = 64 * 1024;

/// Fan-out result for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Subscribers the event was queued for without loss.
    pub delivered: usize,
    /// Subscribers whose queue overflowed or that closed meanwhile.
    pub dropped: usize,
}

/// An event refused by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEvent {
    /// Position in the submitted batch.
    pub index: usize,
    /// Why it was refused.
    pub reason: MalformedEvent,
}

/// Outcome of dispatching a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events that passed validation and were fanned out.
    pub accepted: usize,
    /// Events refused by validation.
    pub rejected: Vec<RejectedEvent>,
    /// Total queue handoffs without loss.
    pub deliveries: usize,
    /// Total handoffs that overflowed or hit a closed connection.
    pub dropped: usize,
}

/// Routes validated events to subscriber queues.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<TopicRegistry>,
    connections: Arc<ConnectionManager>,
    max_event_data_bytes: usize,
}

impl EventDispatcher {
    /// Create a dispatcher over a registry and the manager that owns its connections.
    #[must_use]
    pub fn new(registry: Arc<TopicRegistry>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            registry,
            connections,
            max_event_data_bytes: DEFAULT_MAX_EVENT_DATA_BYTES,
        }
    }

    /// Set the maximum accepted event data size.
    #[must_use]
    pub fn with_max_event_data_bytes(mut self, max: usize) -> Self {
        self.max_event_data_bytes = max;
        self
    }

    /// Dispatch a batch in order.
    ///
    /// Malformed events are rejected individually; the rest of the batch is
    /// still dispatched.
    pub fn dispatch(&self, events: impl IntoIterator<Item = Event>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (index, event) in events.into_iter().enumerate() {
            match self.dispatch_one(event) {
                Ok(fanout) => {
                    report.accepted += 1;
                    report.deliveries += fanout.delivered;
                    report.dropped += fanout.dropped;
                }
                Err(reason) => {
                    debug!(index, reason = %reason, "Rejected malformed event");
                    report.rejected.push(RejectedEvent { index, reason });
                }
            }
        }

        report
    }

    /// Validate and fan out a single event.
    ///
    /// # Errors
    ///
    /// Returns the validation failure; nothing is enqueued in that case.
    pub fn dispatch_one(&self, event: Event) -> Result<Fanout, MalformedEvent> {
        validate_event(&event, self.max_event_data_bytes)?;

        let subscribers = self.registry.subscribers_for(&event.topic);
        let mut fanout = Fanout::default();
        if subscribers.is_empty() {
            trace!(topic = %event.topic, "No subscribers for topic");
            return Ok(fanout);
        }

        let event = Arc::new(event);
        for id in subscribers {
            if self.connections.enqueue(id, Arc::clone(&event)) {
                fanout.delivered += 1;
            } else {
                fanout.dropped += 1;
            }
        }

        trace!(
            topic = %event.topic,
            event = %event.event,
            delivered = fanout.delivered,
            dropped = fanout.dropped,
            "Dispatched event"
        );
        Ok(fanout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionHandle};

    fn setup(config: ConnectionConfig) -> (EventDispatcher, Arc<ConnectionManager>) {
        let registry = Arc::new(TopicRegistry::new());
        let connections = Arc::new(ConnectionManager::with_config(Arc::clone(&registry), config));
        (
            EventDispatcher::new(registry, Arc::clone(&connections)),
            connections,
        )
    }

    fn received(handle: &ConnectionHandle) -> Vec<(String, String)> {
        std::iter::from_fn(|| handle.try_recv())
            .map(|e| (e.topic.clone(), e.event.clone()))
            .collect()
    }

    #[test]
    fn test_dispatch_reaches_every_subscriber() {
        let (dispatcher, connections) = setup(ConnectionConfig::default());
        let a = connections.accept(["todo"]).unwrap();
        let b = connections.accept(["todo", "other"]).unwrap();

        let report = dispatcher.dispatch([Event::new("todo", "todo-update", "")]);

        assert_eq!(report.accepted, 1);
        assert_eq!(report.deliveries, 2);
        assert_eq!(received(&a), [("todo".to_string(), "todo-update".to_string())]);
        assert_eq!(received(&b), [("todo".to_string(), "todo-update".to_string())]);
    }

    #[test]
    fn test_topic_isolation() {
        let (dispatcher, connections) = setup(ConnectionConfig::default());
        let todo = connections.accept(["todo"]).unwrap();

        let report = dispatcher.dispatch([Event::new("other", "ping", "")]);

        assert_eq!(report.accepted, 1);
        assert_eq!(report.deliveries, 0);
        assert!(todo.try_recv().is_none());
    }

    #[test]
    fn test_malformed_events_rejected_individually() {
        let (dispatcher, connections) = setup(ConnectionConfig::default());
        let handle = connections.accept(["todo"]).unwrap();

        let report = dispatcher.dispatch([
            Event::new("todo", "first", ""),
            Event::new("", "no-topic", ""),
            Event::new("todo", "bad\nname", ""),
            Event::new("todo", "last", ""),
        ]);

        assert_eq!(report.accepted, 2);
        let indices: Vec<_> = report.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indices, [1, 2]);
        assert!(matches!(report.rejected[0].reason, MalformedEvent::Topic(_)));
        assert!(matches!(report.rejected[1].reason, MalformedEvent::EventName(_)));

        let names: Vec<_> = received(&handle).into_iter().map(|(_, e)| e).collect();
        assert_eq!(names, ["first", "last"]);
    }

    #[test]
    fn test_data_limit() {
        let (dispatcher, _connections) = setup(ConnectionConfig::default());
        let dispatcher = dispatcher.with_max_event_data_bytes(4);

        assert!(dispatcher.dispatch_one(Event::new("t", "e", "1234")).is_ok());
        assert!(matches!(
            dispatcher.dispatch_one(Event::new("t", "e", "12345")),
            Err(MalformedEvent::DataTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_backpressure_does_not_block_others() {
        let (dispatcher, connections) = setup(ConnectionConfig {
            queue_capacity: 2,
            ..Default::default()
        });
        let slow = connections.accept(["todo"]).unwrap();
        let fast = connections.accept(["todo"]).unwrap();

        let mut dropped = 0;
        for i in 1..=3 {
            let report = dispatcher.dispatch([Event::new("todo", "tick", i.to_string())]);
            dropped += report.dropped;
            // The fast reader keeps up.
            assert_eq!(fast.try_recv().map(|e| e.data.clone()), Some(i.to_string()));
        }

        assert_eq!(dropped, 1);
        let slow_data: Vec<_> = std::iter::from_fn(|| slow.try_recv())
            .map(|e| e.data.clone())
            .collect();
        assert_eq!(slow_data, ["2", "3"]);
    }

    #[test]
    fn test_closed_subscriber_not_reached() {
        let (dispatcher, connections) = setup(ConnectionConfig::default());
        let handle = connections.accept(["todo"]).unwrap();
        drop(handle);

        let report = dispatcher.dispatch([Event::new("todo", "todo-update", "")]);
        assert_eq!(report.deliveries, 0);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test]
    async fn test_publish_then_receive() {
        let (dispatcher, connections) = setup(ConnectionConfig::default());
        let handle = connections.accept(["todo"]).unwrap();

        dispatcher.dispatch([Event::new("todo", "todo-update", "")]);

        let event = handle.recv().await.unwrap();
        assert_eq!(event.event, "todo-update");
        assert!(handle.try_recv().is_none());
    }
}
