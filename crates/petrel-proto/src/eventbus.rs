//! Event-bus payload messages.

use rkyv::{Archive, Deserialize, Serialize};

/// Worker subscribes to named events on the daemon bus.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventbusRegisterListener {
    /// Event names to subscribe to. A repeated name replaces the prior
    /// subscription.
    pub event: Vec<String>,
}

/// Worker publishes an event onto the daemon bus.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventbusPublishEvent {
    /// Event type to publish as.
    pub event_type: String,
    /// Opaque JSON content attached under the well-known field.
    pub event_content_json: String,
}

/// Daemon forwards a subscribed event to the worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventbusEvent {
    /// JSON representation of the event.
    pub event_json: String,
}
