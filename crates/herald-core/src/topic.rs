//! Topic and event validation.
//!
//! Event names end up verbatim in an SSE `event:` line, so anything that
//! would break the line framing is refused before it reaches a queue.

use herald_protocol::Event;
use thiserror::Error;

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Maximum event name length.
pub const MAX_EVENT_NAME_LENGTH: usize = 128;

/// A topic identifier.
pub type TopicId = String;

/// Why an event was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    /// Topic name failed validation.
    #[error("Invalid topic: {0}")]
    Topic(&'static str),

    /// Event name failed validation.
    #[error("Invalid event name: {0}")]
    EventName(&'static str),

    /// Data exceeds the configured limit.
    #[error("Event data too large: {size} bytes (max {max})")]
    DataTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Topic name contains control characters");
    }
    Ok(())
}

/// Validate an event name.
///
/// # Errors
///
/// Returns an error message if the event name is invalid.
pub fn validate_event_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Event name cannot be empty");
    }
    if name.len() > MAX_EVENT_NAME_LENGTH {
        return Err("Event name too long");
    }
    if name.contains(['\r', '\n']) {
        return Err("Event name contains a line break");
    }
    Ok(())
}

/// Validate a submitted event.
///
/// # Errors
///
/// Returns the first rule the event breaks.
pub fn validate_event(event: &Event, max_data_bytes: usize) -> Result<(), MalformedEvent> {
    validate_topic_name(&event.topic).map_err(MalformedEvent::Topic)?;
    validate_event_name(&event.event).map_err(MalformedEvent::EventName)?;
    if event.data.len() > max_data_bytes {
        return Err(MalformedEvent::DataTooLarge {
            size: event.data.len(),
            max: max_data_bytes,
        });
    }
    Ok(())
}
