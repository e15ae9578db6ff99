//! Consumer dispatch and the handler acknowledgment contract.
//!
//! Every delivery runs its handler in its own task; the broker's prefetch
//! window bounds how many are in flight per consumer. The handler's
//! [`Outcome`] decides how the delivery is settled. A handler that returns an
//! error or panics has its delivery rejected.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::broker::{BrokerSession, Delivery, DeliveryReceiver, DeliveryTag};
use crate::error::HandlerError;
use crate::message::Message;
use crate::publisher::{PublishOptions, Publisher};
use crate::topology::DEFAULT_EXCHANGE;
use crate::{Result, TransportError};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; remove from the queue.
    Ack,
    /// Return to the front of the queue.
    Requeue,
    /// Dead-letter (or drop when the queue has no dead-letter exchange).
    Reject,
}

/// Processes one delivery at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(
        &self,
        message: &Message,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError> {
        (**self).handle(message, ctx).await
    }
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure taking owned copies of the message and context.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, DeliveryContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Outcome, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, DeliveryContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Outcome, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: &Message,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError> {
        (self.f)(message.clone(), ctx.clone()).await
    }
}

/// What a handler knows about the delivery it is processing.
#[derive(Clone)]
pub struct DeliveryContext {
    tag: DeliveryTag,
    queue: String,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    correlation_id: Option<CorrelationId>,
    reply_to: Option<String>,
    attempt_count: u32,
    publisher: Publisher,
}

impl DeliveryContext {
    pub(crate) fn new(delivery: &Delivery, publisher: Publisher) -> Self {
        Self {
            tag: delivery.tag,
            queue: delivery.queue.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            correlation_id: delivery.message.correlation_id.clone(),
            reply_to: delivery.message.reply_to.clone(),
            attempt_count: delivery.message.attempt_count(),
            publisher,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    /// Queue the delivery was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// True if the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Attempts already made for this logical message.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Publisher sharing the consumer's connection.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Sends `message` to the request's reply-to queue, carrying the
    /// request's correlation id.
    pub async fn reply(&self, message: Message) -> Result<()> {
        let reply_to = self.reply_to.as_deref().ok_or_else(|| {
            TransportError::PreconditionFailed("request has no reply-to".to_string())
        })?;
        let mut options = PublishOptions::new().persistent(false);
        if let Some(id) = &self.correlation_id {
            options = options.correlation_id(id.clone());
        }
        self.publisher
            .publish_with(DEFAULT_EXCHANGE, reply_to, message, options)
            .await
    }
}

/// Runs the dispatch loop of one consumer until its session closes.
pub(crate) fn spawn_dispatch(
    session: Arc<dyn BrokerSession>,
    mut rx: DeliveryReceiver,
    handler: Arc<dyn MessageHandler>,
    publisher: Publisher,
    consumer_tag: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(consumer = %consumer_tag, "consumer started");
        while let Some(delivery) = rx.recv().await {
            tokio::spawn(process(
                session.clone(),
                handler.clone(),
                publisher.clone(),
                delivery,
            ));
        }
        tracing::debug!(consumer = %consumer_tag, "consumer stopped");
    })
}

#[tracing::instrument(
    skip_all,
    fields(
        queue = %delivery.queue,
        message_type = %delivery.message.message_type,
        tag = %delivery.tag,
    )
)]
async fn process(
    session: Arc<dyn BrokerSession>,
    handler: Arc<dyn MessageHandler>,
    publisher: Publisher,
    delivery: Delivery,
) {
    let ctx = DeliveryContext::new(&delivery, publisher);
    let attempt = ctx.attempt_count();
    let correlation_id = ctx
        .correlation_id()
        .map(|c| c.to_string())
        .unwrap_or_default();
    let joined = AssertUnwindSafe(handler.handle(&delivery.message, &ctx))
        .catch_unwind()
        .await;
    let queue = delivery.queue;
    let tag = delivery.tag;

    let outcome = match joined {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(
                queue = %queue,
                attempt,
                correlation_id = %correlation_id,
                kind = %e.kind(),
                error = %e,
                "handler failed, rejecting message"
            );
            Outcome::Reject
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                queue = %queue,
                attempt,
                correlation_id = %correlation_id,
                panic = %reason,
                "handler panicked, rejecting message"
            );
            Outcome::Reject
        }
    };

    settle(session.as_ref(), &queue, tag, outcome).await;
}

async fn settle(session: &dyn BrokerSession, queue: &str, tag: DeliveryTag, outcome: Outcome) {
    let result = match outcome {
        Outcome::Ack => session.ack(tag).await,
        Outcome::Requeue => session.nack(tag, true).await,
        Outcome::Reject => session.nack(tag, false).await,
    };
    if let Err(e) = result {
        // The broker returns unsettled deliveries to the queue on its own.
        tracing::warn!(queue, %tag, ?outcome, error = %e, "failed to settle delivery");
        return;
    }

    let name = match outcome {
        Outcome::Ack => "messages_acked_total",
        Outcome::Requeue => "messages_requeued_total",
        Outcome::Reject => "messages_rejected_total",
    };
    metrics::counter!(name, "queue" => queue.to_string()).increment(1);
}
