//! Token payload types.
//!
//! A decrypted token is a MessagePack map. Its shape decides what the token
//! grants: a `topics` list is a subscription, an `events` list is a
//! submission. Both structs refuse unknown fields so one shape can never be
//! mistaken for the other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single event envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Topic the event is published to.
    pub topic: String,
    /// Event type name, forwarded as the SSE `event:` field.
    pub event: String,
    /// Opaque payload, forwarded as the SSE `data:` field.
    pub data: String,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Grants read access to a set of topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribePayload {
    /// Topics the bearer may stream.
    pub topics: BTreeSet<String>,
}

/// One or more events to publish, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitPayload {
    /// Events in submission order.
    pub events: Vec<Event>,
}

/// Which endpoint a token is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Subscription token for `GET /events`.
    Subscribe,
    /// Submission token for `POST /submit`.
    Submit,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Subscribe => f.write_str("subscribe"),
            PayloadKind::Submit => f.write_str("submit"),
        }
    }
}

/// A decoded token payload.
///
/// Serialized untagged: the field name inside the map is the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Subscription grant.
    Subscribe(SubscribePayload),
    /// Event submission.
    Submit(SubmitPayload),
}

impl Payload {
    /// Build a subscription payload.
    #[must_use]
    pub fn subscribe<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Payload::Subscribe(SubscribePayload {
            topics: topics.into_iter().map(Into::into).collect(),
        })
    }

    /// Build a submission payload.
    #[must_use]
    pub fn submit(events: impl IntoIterator<Item = Event>) -> Self {
        Payload::Submit(SubmitPayload {
            events: events.into_iter().collect(),
        })
    }

    /// Get the payload kind.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Subscribe(_) => PayloadKind::Subscribe,
            Payload::Submit(_) => PayloadKind::Submit,
        }
    }
}

impl From<SubscribePayload> for Payload {
    fn from(payload: SubscribePayload) -> Self {
        Payload::Subscribe(payload)
    }
}

impl From<SubmitPayload> for Payload {
    fn from(payload: SubmitPayload) -> Self {
        Payload::Submit(payload)
    }
}
