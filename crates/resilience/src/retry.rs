//! Retry with exponential backoff through a delay queue.
//!
//! A failed delivery is republished to the work queue's delay queue with a
//! per-message TTL equal to the backoff delay and an incremented
//! `x-attempt-count`. When the TTL expires the broker dead-letters the copy
//! back into the work queue. Once attempts are exhausted the delivery is
//! rejected, and the work queue's dead-letter exchange takes it.
//!
//! ```text
//! attempt   delay (base = 1s)
//! ─────────────────────────────
//!    0          1s
//!    1          2s
//!    2          4s
//!   >=max   dead letter
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use transport::{
    Binding, DeliveryContext, ExchangeDeclaration, HandlerError, Message, MessageHandler,
    Outcome, PublishOptions, QueueDeclaration, Topology, headers,
};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Backoff schedule and retry ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed before the message is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Random spread applied to each delay, in `0.0..=1.0` (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy without jitter.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Returns true if a message that has made `attempt` retries may retry again.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt + 1`, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        delay.mul_f64(1.0 + spread).min(self.max_delay)
    }
}

/// Wraps a handler with delay-queue retries.
///
/// Explicit outcomes from the inner handler pass through untouched; only
/// errors trigger a retry.
pub struct Retry<H> {
    inner: H,
    policy: RetryPolicy,
    delay_queue: Option<String>,
}

impl<H: MessageHandler> Retry<H> {
    /// Retries failures of `inner` according to `policy`.
    ///
    /// Retries go to `<queue>.delay`, where `<queue>` is the queue the
    /// delivery came from; see [`RetryTopology`].
    pub fn wrap(inner: H, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            delay_queue: None,
        }
    }

    /// Publishes retries to a fixed delay queue instead.
    pub fn with_delay_queue(mut self, queue: impl Into<String>) -> Self {
        self.delay_queue = Some(queue.into());
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Retry<H> {
    async fn handle(&self, message: &Message, ctx: &DeliveryContext) -> Result<Outcome, HandlerError> {
        let error = match self.inner.handle(message, ctx).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        let attempt = message.attempt_count();
        let max_retries = message.max_attempts().unwrap_or(self.policy.max_retries);
        if message.id.is_none() && message.correlation_id.is_none() {
            tracing::warn!(
                queue = ctx.queue(),
                message_type = %message.message_type,
                "retrying a message that has neither id nor correlation id"
            );
        }

        if attempt >= max_retries {
            metrics::counter!("retry_exhausted_total", "queue" => ctx.queue().to_string())
                .increment(1);
            tracing::error!(
                queue = ctx.queue(),
                attempt,
                max_retries,
                correlation_id = ?message.correlation_id,
                error = %error,
                "retries exhausted, dead-lettering message"
            );
            return Err(HandlerError::RetryExhausted {
                attempts: attempt,
                reason: error.to_string(),
            });
        }

        let delay = self.policy.delay_for(attempt);
        let mut retry = message.clone();
        retry.set_header(headers::ATTEMPT_COUNT, attempt + 1);
        retry.set_header(headers::MAX_ATTEMPTS, max_retries);
        retry.expiration = Some(delay);

        let delay_queue = self
            .delay_queue
            .clone()
            .unwrap_or_else(|| RetryTopology::delay_queue_name(ctx.queue()));
        if let Err(e) = ctx
            .publisher()
            .send_to_queue(&delay_queue, retry, PublishOptions::default())
            .await
        {
            tracing::warn!(
                queue = ctx.queue(),
                attempt,
                error = %e,
                "could not schedule retry, requeueing"
            );
            return Ok(Outcome::Requeue);
        }

        metrics::counter!("retry_scheduled_total", "queue" => ctx.queue().to_string())
            .increment(1);
        tracing::info!(
            queue = ctx.queue(),
            attempt = attempt + 1,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            correlation_id = ?message.correlation_id,
            error = %error,
            "handler failed, retry scheduled"
        );
        Ok(Outcome::Ack)
    }
}

/// Queue layout that makes [`Retry`] work for one work queue.
///
/// - the work queue dead-letters to `dead_letter_exchange` with its own name
///   as routing key
/// - `<queue>.delay` holds retries until their TTL expires, then dead-letters
///   them back into the work queue through the default exchange
/// - `<queue>.dead` is bound to `dead_letter_exchange` and collects
///   exhausted messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    pub work_queue: QueueDeclaration,
    pub delay_queue: QueueDeclaration,
    pub dead_queue: QueueDeclaration,
    pub dead_letter_exchange: ExchangeDeclaration,
}

impl RetryTopology {
    pub fn for_queue(queue: &str, dead_letter_exchange: &str) -> Self {
        Self {
            work_queue: QueueDeclaration::durable(queue)
                .with_dead_letter(dead_letter_exchange, Some(queue.to_string())),
            delay_queue: QueueDeclaration::durable(Self::delay_queue_name(queue))
                .with_dead_letter(transport::DEFAULT_EXCHANGE, Some(queue.to_string())),
            dead_queue: QueueDeclaration::durable(Self::dead_queue_name(queue)),
            dead_letter_exchange: ExchangeDeclaration::direct(dead_letter_exchange),
        }
    }

    /// Applies `f` to the work queue declaration (priority, single active
    /// consumer, ...).
    pub fn map_work_queue(mut self, f: impl FnOnce(QueueDeclaration) -> QueueDeclaration) -> Self {
        self.work_queue = f(self.work_queue);
        self
    }

    pub fn delay_queue_name(queue: &str) -> String {
        format!("{queue}.delay")
    }

    pub fn dead_queue_name(queue: &str) -> String {
        format!("{queue}.dead")
    }

    pub fn topology(&self) -> Topology {
        let mut topology = Topology::new();
        topology.add_exchange(self.dead_letter_exchange.clone());
        topology.add_queue(self.work_queue.clone());
        topology.add_queue(self.delay_queue.clone());
        topology.add_queue(self.dead_queue.clone());
        topology.add_binding(Binding::new(
            self.dead_queue.name.clone(),
            self.dead_letter_exchange.name.clone(),
            self.work_queue.name.clone(),
        ));
        topology
    }
}

impl From<RetryTopology> for Topology {
    fn from(retry: RetryTopology) -> Self {
        retry.topology()
    }
}
