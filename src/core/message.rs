use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Broker-assigned message identifier, unique and increasing within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub fn from_raw(value: u64) -> Self {
        MessageId(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An outgoing message handed to `Producer::send`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerMessage {
    pub payload: Bytes,
    /// Routing key, used by key-shared subscriptions.
    pub key: Option<String>,
    pub properties: BTreeMap<String, String>,
    /// Application-defined event time in milliseconds since the epoch.
    pub event_time: Option<u64>,
}

impl ProducerMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_event_time(mut self, event_time_ms: u64) -> Self {
        self.event_time = Some(event_time_ms);
        self
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Bytes,
    pub key: Option<String>,
    pub properties: BTreeMap<String, String>,
    /// Time the broker accepted the message, in milliseconds since the epoch.
    pub publish_time: u64,
    pub event_time: Option<u64>,
    /// How many times this message was handed out before this delivery.
    pub redelivery_count: u32,
}

impl Message {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
