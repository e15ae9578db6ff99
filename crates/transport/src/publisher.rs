use std::time::Duration;

use common::CorrelationId;
use serde::Serialize;

use crate::Result;
use crate::connection::Connection;
use crate::message::{Headers, Message, headers};
use crate::topology::DEFAULT_EXCHANGE;

/// Delivery options applied to a message at publish time.
///
/// Unset options leave the message's own properties untouched.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub headers: Headers,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub persistent: Option<bool>,
    /// Written to `x-max-attempts`.
    pub max_attempts: Option<u32>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn apply(self, message: &mut Message) {
        if let Some(priority) = self.priority {
            message.priority = Some(priority);
        }
        if let Some(ttl) = self.expiration {
            message.expiration = Some(ttl);
        }
        if let Some(id) = self.correlation_id {
            message.correlation_id = Some(id);
        }
        if let Some(queue) = self.reply_to {
            message.reply_to = Some(queue);
        }
        if let Some(persistent) = self.persistent {
            message.persistent = persistent;
        }
        if let Some(max) = self.max_attempts {
            message.set_header(headers::MAX_ATTEMPTS, max);
        }
        message.headers.extend(self.headers);
    }
}

/// Sends messages through a shared [`Connection`].
#[derive(Clone)]
pub struct Publisher {
    connection: Connection,
}

impl Publisher {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Publishes a message with default options.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        self.connection
            .publish(exchange, routing_key, message, PublishOptions::default())
            .await
    }

    /// Publishes a message with explicit delivery options.
    pub async fn publish_with(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        options: PublishOptions,
    ) -> Result<()> {
        self.connection
            .publish(exchange, routing_key, message, options)
            .await
    }

    /// Serializes `payload` as JSON and publishes it as `message_type`.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message_type: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let message = Message::json(message_type, payload)?;
        self.connection
            .publish(exchange, routing_key, message, options)
            .await
    }

    /// Sends a message straight to a queue through the default exchange.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        message: Message,
        options: PublishOptions,
    ) -> Result<()> {
        self.connection
            .publish(DEFAULT_EXCHANGE, queue, message, options)
            .await
    }
}
