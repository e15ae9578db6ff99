use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{CorrelationId, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known header names carried on the wire.
pub mod headers {
    /// Number of delivery attempts already made for this logical message.
    pub const ATTEMPT_COUNT: &str = "x-attempt-count";
    /// Attempt ceiling after which the message is dead-lettered.
    pub const MAX_ATTEMPTS: &str = "x-max-attempts";
    /// RFC 3339 publish timestamp.
    pub const TIMESTAMP: &str = "x-timestamp";
    /// Dead-letter trail appended by the broker.
    pub const DEATH: &str = "x-death";
    /// Business key consulted by the idempotency filter.
    pub const IDEMPOTENCY_KEY: &str = "x-idempotency-key";
    /// Business error forwarded by a request/reply responder.
    pub const RPC_ERROR: &str = "x-rpc-error";
}

/// Header map of a message.
pub type Headers = HashMap<String, serde_json::Value>;

/// The unit of transport.
///
/// The payload is opaque to the core; business services decode it with
/// [`Message::decode`] or their own codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, assigned at publish time when absent.
    pub id: Option<MessageId>,

    /// Semantic kind of message, e.g. `"order.created"`.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Uninterpreted body.
    pub payload: Bytes,

    /// Header map (attempt counters, timestamps, trace metadata).
    #[serde(default)]
    pub headers: Headers,

    /// Priority; only honoured by queues declared with a max priority.
    pub priority: Option<u8>,

    /// Correlation id linking a request to its reply.
    pub correlation_id: Option<CorrelationId>,

    /// Queue to which replies should be sent.
    pub reply_to: Option<String>,

    /// Per-message time to live.
    pub expiration: Option<Duration>,

    /// Whether the broker should persist the message.
    pub persistent: bool,
}

impl Message {
    /// Creates a persistent message with the given type and raw payload.
    pub fn new(message_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            payload: payload.into(),
            headers: Headers::new(),
            priority: None,
            correlation_id: None,
            reply_to: None,
            expiration: None,
            persistent: true,
        }
    }

    /// Creates a message whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_vec(payload)?))
    }

    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&serde_json::Value> {
        self.headers.get(name)
    }

    /// Returns a header value if it is a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.as_str())
    }

    /// Sets a header value, replacing any previous one.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Returns the attempt counter (0 when the header is missing).
    pub fn attempt_count(&self) -> u32 {
        self.header(headers::ATTEMPT_COUNT)
            .and_then(|v| v.as_u64())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Returns the configured attempt ceiling, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        self.header(headers::MAX_ATTEMPTS)
            .and_then(|v| v.as_u64())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Returns the publish timestamp, if stamped.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.header_str(headers::TIMESTAMP)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Returns the dead-letter trail, most recent entry first.
    pub fn deaths(&self) -> Vec<DeathRecord> {
        self.header(headers::DEATH)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Records a dead-lettering event.
    ///
    /// An existing entry for the same queue and reason has its count bumped
    /// and moves to the front; otherwise a new entry is prepended.
    pub fn push_death(&mut self, mut record: DeathRecord) {
        let mut trail = self.deaths();
        if let Some(pos) = trail
            .iter()
            .position(|d| d.queue == record.queue && d.reason == record.reason)
        {
            let existing = trail.remove(pos);
            record.count = existing.count + 1;
        }
        trail.insert(0, record);
        if let Ok(value) = serde_json::to_value(trail) {
            self.headers.insert(headers::DEATH.to_string(), value);
        }
    }
}

/// Why the broker dead-lettered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeathReason {
    /// Negatively acknowledged without requeue.
    Rejected,
    /// Per-message or queue TTL elapsed.
    Expired,
}

/// One entry of the `x-death` trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from.
    pub queue: String,
    /// Why it was dead-lettered.
    pub reason: DeathReason,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Routing key the message was originally published with.
    pub routing_key: String,
    /// How many times this (queue, reason) pair occurred.
    pub count: u32,
    /// When the latest occurrence happened.
    pub time: DateTime<Utc>,
}

/// Builder for constructing messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    message_type: Option<String>,
    payload: Option<Bytes>,
    headers: Headers,
    priority: Option<u8>,
    correlation_id: Option<CorrelationId>,
    reply_to: Option<String>,
    expiration: Option<Duration>,
    transient: bool,
}

impl MessageBuilder {
    /// Sets the message ID. If not set, one is generated at publish time.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Sets the raw payload.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn json_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(Bytes::from(serde_json::to_vec(payload)?));
        Ok(self)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the reply-to queue.
    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Sets the per-message time to live.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Marks the message as transient (not persisted by the broker).
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Builds the message.
    ///
    /// # Panics
    ///
    /// Panics if the message type is not set.
    pub fn build(self) -> Message {
        Message {
            id: self.id,
            message_type: self.message_type.expect("message_type is required"),
            payload: self.payload.unwrap_or_default(),
            headers: self.headers,
            priority: self.priority,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            expiration: self.expiration,
            persistent: !self.transient,
        }
    }

    /// Tries to build the message, returning None if the type is missing.
    pub fn try_build(self) -> Option<Message> {
        Some(Message {
            id: self.id,
            message_type: self.message_type?,
            payload: self.payload.unwrap_or_default(),
            headers: self.headers,
            priority: self.priority,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            expiration: self.expiration,
            persistent: !self.transient,
        })
    }
}
