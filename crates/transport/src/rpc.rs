//! Request/reply over the broker.
//!
//! An [`RpcClient`] owns one exclusive reply queue and a table of callers
//! waiting for a reply, keyed by correlation id. A call that times out or is
//! cancelled removes its entry; replies arriving afterwards are discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{CorrelationId, ErrorKind};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::ConsumeOptions;
use crate::connection::Connection;
use crate::consumer::{DeliveryContext, MessageHandler, Outcome};
use crate::error::HandlerError;
use crate::message::{Message, headers};
use crate::publisher::PublishOptions;
use crate::topology::QueueDeclaration;
use crate::TransportError;

/// Errors seen by request/reply callers.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("No reply for correlation id {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The responder reported a business error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Another call is already waiting on this correlation id.
    #[error("Correlation id {0} is already awaiting a reply")]
    CorrelationInUse(CorrelationId),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Timeout { .. } => ErrorKind::Timeout,
            RpcError::Transport(e) => e.kind(),
            RpcError::Remote(_) | RpcError::CorrelationInUse(_) => ErrorKind::Processing,
        }
    }
}

/// Request/reply settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline used by [`RpcClient::call_default`].
    pub default_timeout: Duration,
    /// Prefix of the per-client reply queue name.
    pub reply_queue_prefix: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            reply_queue_prefix: "rpc.reply".to_string(),
        }
    }
}

type Pending = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Message>>>>;

fn lock(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Message>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of request/reply.
#[derive(Clone)]
pub struct RpcClient {
    connection: Connection,
    reply_queue: String,
    pending: Pending,
    config: RpcConfig,
}

impl RpcClient {
    /// Declares the client's exclusive reply queue and starts consuming it.
    pub async fn new(connection: &Connection, config: RpcConfig) -> Result<Self, RpcError> {
        let reply_queue = format!("{}.{}", config.reply_queue_prefix, Uuid::new_v4());
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        connection
            .declare_queue(QueueDeclaration::exclusive(&reply_queue))
            .await?;
        connection
            .consume(
                &reply_queue,
                ReplyHandler {
                    pending: pending.clone(),
                },
                ConsumeOptions::with_prefetch(0).tagged(reply_queue.clone()),
            )
            .await?;

        tracing::debug!(%reply_queue, "rpc client ready");
        Ok(Self {
            connection: connection.clone(),
            reply_queue,
            pending,
            config,
        })
    }

    /// Name of the reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of callers waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Sends `request` with a fresh correlation id and waits for the reply.
    pub async fn call(
        &self,
        exchange: &str,
        routing_key: &str,
        request: Message,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        self.call_with_correlation(exchange, routing_key, request, CorrelationId::new(), timeout)
            .await
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(
        &self,
        exchange: &str,
        routing_key: &str,
        request: Message,
    ) -> Result<Message, RpcError> {
        self.call(exchange, routing_key, request, self.config.default_timeout)
            .await
    }

    /// Sends `request` under a caller-chosen correlation id.
    ///
    /// Fails with `CorrelationInUse` if another call is waiting on that id.
    pub async fn call_with_correlation(
        &self,
        exchange: &str,
        routing_key: &str,
        request: Message,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&correlation_id) {
                return Err(RpcError::CorrelationInUse(correlation_id));
            }
            pending.insert(correlation_id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        metrics::counter!("rpc_calls_total").increment(1);
        let options = PublishOptions::new()
            .correlation_id(correlation_id.clone())
            .reply_to(self.reply_queue.clone());
        self.connection
            .publish(exchange, routing_key, request, options)
            .await?;

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RpcError::Transport(TransportError::SessionClosed)),
            Err(_) => {
                metrics::counter!("rpc_timeouts_total").increment(1);
                tracing::warn!(
                    exchange,
                    routing_key,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "rpc call timed out"
                );
                return Err(RpcError::Timeout {
                    correlation_id: correlation_id.clone(),
                    timeout,
                });
            }
        };

        match reply.header_str(headers::RPC_ERROR) {
            Some(error) => Err(RpcError::Remote(error.to_string())),
            None => Ok(reply),
        }
    }
}

/// Removes the waiting entry however the call ends.
struct PendingGuard<'a> {
    pending: &'a Pending,
    correlation_id: &'a CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.correlation_id);
    }
}

struct ReplyHandler {
    pending: Pending,
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, message: &Message, ctx: &DeliveryContext) -> Result<Outcome, HandlerError> {
        let waiter = message
            .correlation_id
            .as_ref()
            .and_then(|id| lock(&self.pending).remove(id));

        match waiter {
            Some(tx) => {
                if tx.send(message.clone()).is_err() {
                    tracing::info!(queue = ctx.queue(), "caller gone, reply discarded");
                }
            }
            None => tracing::info!(
                queue = ctx.queue(),
                correlation_id = ?message.correlation_id,
                "late or unknown reply discarded"
            ),
        }
        Ok(Outcome::Ack)
    }
}

/// Server side of request/reply: answers each request with the closure's
/// result.
///
/// A business error is sent back as an empty reply carrying `x-rpc-error`,
/// which the caller sees as [`RpcError::Remote`].
pub struct Responder<F> {
    f: F,
}

impl<F> Responder<F> {
    pub fn new<Fut, E>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Message, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, E> MessageHandler for Responder<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async fn handle(&self, message: &Message, ctx: &DeliveryContext) -> Result<Outcome, HandlerError> {
        if ctx.reply_to().is_none() {
            return Err(HandlerError::processing("request has no reply-to"));
        }

        let reply = match (self.f)(message.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    message_type = %message.message_type,
                    error = %e,
                    "request failed, forwarding error to caller"
                );
                let mut reply = Message::new(format!("{}.error", message.message_type), Bytes::new());
                reply.set_header(headers::RPC_ERROR, e.to_string());
                reply
            }
        };
        ctx.reply(reply).await?;
        Ok(Outcome::Ack)
    }
}
