//! The broker wire contract.
//!
//! [`Broker`] opens sessions; a [`BrokerSession`] declares topology, publishes,
//! consumes and settles deliveries. A session that closes (network failure,
//! broker restart) returns every unsettled delivery to its queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::message::Message;
use crate::topology::{Binding, ExchangeDeclaration, QueueDeclaration};

/// Broker-assigned identifier of a delivery, unique per broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer, awaiting settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// True if the message was delivered before and returned to the queue.
    pub redelivered: bool,
    pub message: Message,
}

/// Receiving end of a consumer; closes when the consumer's session closes.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Options for registering a consumer.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Maximum unsettled deliveries held by this consumer; 0 means unbounded.
    pub prefetch: u16,
    /// Name used in logs and metrics.
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            consumer_tag: None,
        }
    }
}

impl ConsumeOptions {
    /// Creates options with the given prefetch window.
    pub fn with_prefetch(prefetch: u16) -> Self {
        Self {
            prefetch,
            ..Self::default()
        }
    }

    /// Sets the consumer tag.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// Entry point to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a new session.
    ///
    /// Fails with `Unreachable` when the broker cannot be reached.
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>>;
}

/// One open session with the broker.
///
/// All operations fail with `SessionClosed` once the session has closed.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declares an exchange. Redeclaring an identical exchange is a no-op.
    async fn declare_exchange(&self, decl: &ExchangeDeclaration) -> Result<()>;

    /// Declares a queue. Redeclaring an identical queue is a no-op.
    async fn declare_queue(&self, decl: &QueueDeclaration) -> Result<()>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Publishes a message. Unroutable messages are dropped by the broker.
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()>;

    /// Starts consuming from a queue.
    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<DeliveryReceiver>;

    /// Acknowledges a delivery, removing it from the queue.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledges a delivery.
    ///
    /// With `requeue` the message returns to the front of its queue;
    /// otherwise it is dead-lettered, or dropped if the queue has no
    /// dead-letter exchange.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Returns true while the session is open.
    fn is_open(&self) -> bool;

    /// Resolves once the session has closed, for whatever reason.
    async fn closed(&self);

    /// Closes the session.
    async fn close(&self);
}
