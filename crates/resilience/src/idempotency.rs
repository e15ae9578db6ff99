//! Suppression of already-processed messages by business key.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use transport::{DeliveryContext, HandlerError, Message, MessageHandler, Outcome, headers};

/// Storage of processed business keys.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if `key` completed within the retention window.
    async fn is_processed(&self, key: &str) -> bool;

    /// Records `key` as completed. Recording an existing key is a no-op.
    async fn mark_processed(&self, key: &str);

    /// Number of keys currently retained.
    async fn len(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a key is remembered.
    pub retention: Duration,
    /// Maximum keys retained; the oldest are evicted first.
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            max_entries: 100_000,
        }
    }
}

#[derive(Default)]
struct KeySet {
    recorded: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl KeySet {
    fn evict(&mut self, config: &IdempotencyConfig) {
        let now = Instant::now();
        while let Some((key, at)) = self.order.front() {
            let expired = now.duration_since(*at) >= config.retention;
            if !expired && self.order.len() <= config.max_entries {
                break;
            }
            if self.recorded.get(key) == Some(at) {
                self.recorded.remove(key);
            }
            self.order.pop_front();
        }
    }
}

/// In-process key store bounded by retention time and entry count.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    keys: Arc<Mutex<KeySet>>,
    config: IdempotencyConfig,
}

impl InMemoryIdempotencyStore {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            keys: Arc::default(),
            config,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().await;
        keys.evict(&self.config);
        keys.recorded.contains_key(key)
    }

    async fn mark_processed(&self, key: &str) {
        let mut keys = self.keys.lock().await;
        keys.evict(&self.config);
        if keys.recorded.contains_key(key) {
            return;
        }
        let now = Instant::now();
        keys.recorded.insert(key.to_string(), now);
        keys.order.push_back((key.to_string(), now));
        keys.evict(&self.config);
    }

    async fn len(&self) -> usize {
        let mut keys = self.keys.lock().await;
        keys.evict(&self.config);
        keys.recorded.len()
    }
}

/// Extracts the business key of a message; `None` disables the filter for
/// that message.
pub type KeyExtractor = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// Uses the `x-idempotency-key` header, falling back to the message id.
pub fn default_key(message: &Message) -> Option<String> {
    message
        .header_str(headers::IDEMPOTENCY_KEY)
        .map(str::to_string)
        .or_else(|| message.id.map(|id| id.to_string()))
}

/// Wraps a handler so that a business key is processed at most once per
/// retention window.
///
/// The key is recorded only when the inner handler acks. Place this inside
/// [`Retry`](crate::Retry), not around it: the retry decorator acks the
/// original delivery after scheduling a retry.
pub struct Idempotent<H> {
    inner: H,
    store: Arc<dyn IdempotencyStore>,
    extract: KeyExtractor,
}

impl<H: MessageHandler> Idempotent<H> {
    pub fn wrap<F>(inner: H, store: Arc<dyn IdempotencyStore>, extract: F) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            inner,
            store,
            extract: Arc::new(extract),
        }
    }

    /// Wraps with [`default_key`].
    pub fn with_default_key(inner: H, store: Arc<dyn IdempotencyStore>) -> Self {
        Self::wrap(inner, store, default_key)
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Idempotent<H> {
    async fn handle(&self, message: &Message, ctx: &DeliveryContext) -> Result<Outcome, HandlerError> {
        let Some(key) = (self.extract)(message) else {
            tracing::debug!(
                queue = ctx.queue(),
                message_type = %message.message_type,
                "no business key, processing without duplicate check"
            );
            return self.inner.handle(message, ctx).await;
        };

        if self.store.is_processed(&key).await {
            metrics::counter!("idempotent_duplicates_total", "queue" => ctx.queue().to_string())
                .increment(1);
            tracing::info!(
                queue = ctx.queue(),
                idempotency_key = %key,
                "message already processed, skipping handler"
            );
            return Ok(Outcome::Ack);
        }

        let outcome = self.inner.handle(message, ctx).await?;
        if outcome == Outcome::Ack {
            self.store.mark_processed(&key).await;
        }
        Ok(outcome)
    }
}
