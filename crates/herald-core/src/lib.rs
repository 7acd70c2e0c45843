//! # herald-core
//!
//! Fan-out machinery for the Herald SSE gateway.
//!
//! - **Topic** - Topic and event validation
//! - **Registry** - Concurrent topic → connection index
//! - **Connection** - Per-subscriber bounded queues and their lifecycle
//! - **Dispatcher** - Validates submitted events and enqueues them on subscribers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌───────────────────┐
//! │ Dispatcher  │────▶│  Registry   │     │ ConnectionManager │
//! └─────────────┘     └─────────────┘     └───────────────────┘
//!        │                  ▲                       │
//!        │                  └──── subscribe/unsub ──┤
//!        └──────────── enqueue(id, event) ─────────▶│
//!                                                   ▼
//!                                          ConnectionHandle::recv
//! ```

pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod topic;

pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionId, ConnectionManager,
    ConnectionState, ConnectionStats, OverflowPolicy,
};
pub use dispatcher::{
    DispatchReport, EventDispatcher, Fanout, RejectedEvent, DEFAULT_MAX_EVENT_DATA_BYTES,
};
pub use herald_protocol::Event;
pub use registry::{RegistryStats, TopicRegistry};
pub use topic::{
    validate_event, validate_event_name, validate_topic_name, MalformedEvent, TopicId,
};
