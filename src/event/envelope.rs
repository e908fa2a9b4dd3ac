use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which delivery mechanism produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    ObjectCreated,
    TableChange,
    QueueMessage,
    /// Synchronous gateway request bound to a compute integration.
    GatewayRequest,
    /// Topic notification pushed to a compute subscription.
    TopicNotification,
}

/// An event handed to a compute function.
///
/// Fields are private; an event cannot be changed once built. `payload` is an
/// opaque byte string (JSON in every built-in producer) and `attributes`
/// carries routing metadata such as the object key or queue name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    source: EventSource,
    payload: Bytes,
    attributes: HashMap<String, String>,
    received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(source: EventSource, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            payload: payload.into(),
            attributes: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Build a JSON-payload event.
    pub fn json(source: EventSource, value: &serde_json::Value) -> serde_json::Result<Self> {
        Ok(Self::new(source, serde_json::to_vec(value)?))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Decode the payload as JSON.
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}
