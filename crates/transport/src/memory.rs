use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

use crate::broker::{
    Broker, BrokerSession, ConsumeOptions, Delivery, DeliveryReceiver, DeliveryTag,
};
use crate::message::{DeathReason, DeathRecord, Message};
use crate::topology::{
    Binding, DEFAULT_EXCHANGE, ExchangeDeclaration, ExchangeKind, QueueDeclaration,
};
use crate::{Result, TransportError};

/// In-memory broker for testing and local runs.
///
/// Implements the same wire contract as a real broker: exchange routing
/// (direct, topic, fanout, headers), priority queues, per-message and
/// per-queue TTL, dead-lettering with an `x-death` trail, prefetch windows,
/// exclusive and auto-delete queues, single-active-consumer queues.
///
/// Outages are simulated with [`fail_connections`](Self::fail_connections),
/// [`set_reachable`](Self::set_reachable) and [`restart`](Self::restart).
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    exchanges: HashMap<String, ExchangeDeclaration>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    sessions: HashMap<u64, watch::Sender<bool>>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_session: u64,
    next_consumer: u64,
    next_tag: u64,
}

struct QueueState {
    decl: QueueDeclaration,
    owner: Option<u64>,
    ready: BTreeMap<(Reverse<u8>, i64), Queued>,
    front_seq: i64,
    back_seq: i64,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    had_consumer: bool,
}

#[derive(Clone)]
struct Queued {
    message: Message,
    exchange: String,
    routing_key: String,
    priority: u8,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    session: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: u16,
    in_flight: usize,
}

struct Unacked {
    queue: String,
    consumer: u64,
    session: u64,
    queued: Queued,
}

impl QueueState {
    fn new(decl: QueueDeclaration, owner: Option<u64>) -> Self {
        Self {
            decl,
            owner,
            ready: BTreeMap::new(),
            front_seq: 0,
            back_seq: 0,
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        }
    }

    fn push_back(&mut self, queued: Queued) {
        self.back_seq += 1;
        self.ready.insert((Reverse(queued.priority), self.back_seq), queued);
    }

    fn push_front(&mut self, queued: Queued) {
        self.front_seq -= 1;
        self.ready
            .insert((Reverse(queued.priority), self.front_seq), queued);
    }

    /// Picks the next consumer with spare prefetch capacity.
    fn next_consumer(&mut self) -> Option<usize> {
        let has_capacity =
            |c: &ConsumerSlot| c.prefetch == 0 || c.in_flight < usize::from(c.prefetch);

        if self.decl.single_active_consumer {
            return self.consumers.first().filter(|c| has_capacity(*c)).map(|_| 0);
        }

        let len = self.consumers.len();
        let start = self.cursor;
        let idx = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| has_capacity(&self.consumers[idx]))?;
        self.cursor = (idx + 1) % len;
        Some(idx)
    }

    fn release_slot(&mut self, consumer: u64) {
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.id == consumer) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

impl InMemoryBroker {
    /// Creates a new, empty, reachable broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes every open session, as a network partition would.
    ///
    /// Unsettled deliveries return to their queues; exclusive queues are
    /// deleted. New connections succeed immediately.
    pub async fn fail_connections(&self) {
        let mut state = self.state.lock().await;
        state.close_all_sessions(self);
    }

    /// Makes the broker reachable or unreachable. Going unreachable also
    /// closes every open session.
    pub async fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().await;
        state.unreachable = !reachable;
        if !reachable {
            state.close_all_sessions(self);
        }
    }

    /// Simulates a broker restart: closes every session and discards
    /// transient exchanges, transient queues and non-persistent messages.
    pub async fn restart(&self) {
        let mut state = self.state.lock().await;
        state.close_all_sessions(self);
        state.exchanges.retain(|_, e| e.durable);
        state.queues.retain(|_, q| q.decl.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|_, q| q.message.persistent);
        }
        let BrokerState {
            bindings,
            exchanges,
            queues,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
    }

    /// Returns the number of messages ready for delivery in a queue.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Returns the number of delivered but unsettled messages of a queue.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.unacked.values().filter(|u| u.queue == queue).count()
    }

    /// Returns the number of consumers attached to a queue.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Returns true if the queue exists.
    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    /// Returns the number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Removes and returns every ready message of a queue, in delivery order.
    pub async fn drain(&self, queue: &str) -> Vec<Message> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(queue) {
            Some(q) => std::mem::take(&mut q.ready)
                .into_values()
                .map(|queued| queued.message)
                .collect(),
            None => Vec::new(),
        }
    }

    async fn expire_due(&self, queue: &str) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<Queued> = match state.queues.get_mut(queue) {
            Some(q) => {
                let keys: Vec<_> = q
                    .ready
                    .iter()
                    .filter(|(_, queued)| queued.expires_at.is_some_and(|at| at <= now))
                    .map(|(key, _)| *key)
                    .collect();
                keys.into_iter().filter_map(|k| q.ready.remove(&k)).collect()
            }
            None => return,
        };
        for queued in expired {
            state.dead_letter(self, queue, queued, DeathReason::Expired);
        }
    }
}

impl BrokerState {
    fn ensure_open(&self, session: u64) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }

    fn close_all_sessions(&mut self, broker: &InMemoryBroker) {
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(broker, id);
        }
    }

    fn close_session(&mut self, broker: &InMemoryBroker, session: u64) {
        let Some(closed) = self.sessions.remove(&session) else {
            return;
        };
        let _ = closed.send(true);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
            queue.cursor = 0;
        }

        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so the oldest delivery ends up at the very front.
        tags.sort_by(|a, b| b.cmp(a));
        let mut touched = Vec::new();
        for tag in tags {
            if let Some(mut unacked) = self.unacked.remove(&tag)
                && let Some(queue) = self.queues.get_mut(&unacked.queue)
            {
                unacked.queued.redelivered = true;
                queue.push_front(unacked.queued);
                touched.push(unacked.queue);
            }
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| {
                q.owner == Some(session)
                    || (q.decl.auto_delete && q.had_consumer && q.consumers.is_empty())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed {
            self.delete_queue(&name);
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.pump(broker, &queue);
        }
        tracing::debug!(session, "in-memory session closed");
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        self.unacked.retain(|_, u| u.queue != name);
    }

    fn route(
        &mut self,
        broker: &InMemoryBroker,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<usize> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|e| e.kind)
                .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.matches(kind, routing_key, &message.headers))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "unroutable message dropped");
        }
        for queue in &targets {
            self.enqueue(broker, queue, message.clone(), exchange, routing_key);
        }
        Ok(targets.len())
    }

    fn enqueue(
        &mut self,
        broker: &InMemoryBroker,
        queue_name: &str,
        message: Message,
        exchange: &str,
        routing_key: &str,
    ) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let priority = match queue.decl.max_priority {
            Some(max) => message.priority.unwrap_or(0).min(max),
            None => 0,
        };
        let ttl = match (message.expiration, queue.decl.message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);

        queue.push_back(Queued {
            message,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            priority,
            expires_at,
            redelivered: false,
        });

        if let Some(at) = expires_at {
            let broker = broker.clone();
            let name = queue_name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                broker.expire_due(&name).await;
            });
        }

        self.pump(broker, queue_name);
    }

    fn dead_letter(
        &mut self,
        broker: &InMemoryBroker,
        queue_name: &str,
        queued: Queued,
        reason: DeathReason,
    ) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };
        let Some(dlx) = queue.decl.dead_letter_exchange.clone() else {
            if reason == DeathReason::Rejected {
                tracing::error!(
                    queue = queue_name,
                    message_type = %queued.message.message_type,
                    "rejected message dropped: queue has no dead-letter exchange"
                );
            }
            return;
        };
        let routing_key = queue
            .decl
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| queued.routing_key.clone());

        let mut message = queued.message;
        message.expiration = None;
        message.push_death(DeathRecord {
            queue: queue_name.to_string(),
            reason,
            exchange: queued.exchange,
            routing_key: queued.routing_key,
            count: 1,
            time: Utc::now(),
        });

        match self.route(broker, &dlx, &routing_key, message) {
            Ok(_) => {
                let reason = match reason {
                    DeathReason::Rejected => "rejected",
                    DeathReason::Expired => "expired",
                };
                metrics::counter!(
                    "messages_dead_lettered_total",
                    "queue" => queue_name.to_string(),
                    "reason" => reason
                )
                .increment(1);
            }
            Err(e) => {
                tracing::error!(queue = queue_name, error = %e, "dead-letter routing failed");
            }
        }
    }

    fn pump(&mut self, broker: &InMemoryBroker, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(idx) = queue.next_consumer() else {
                return;
            };
            let Some((key, queued)) = queue.ready.pop_first() else {
                return;
            };

            if queued.expires_at.is_some_and(|at| at <= Instant::now()) {
                self.dead_letter(broker, queue_name, queued, DeathReason::Expired);
                continue;
            }

            self.next_tag += 1;
            let tag = DeliveryTag(self.next_tag);
            let delivery = Delivery {
                tag,
                queue: queue_name.to_string(),
                exchange: queued.exchange.clone(),
                routing_key: queued.routing_key.clone(),
                redelivered: queued.redelivered,
                message: queued.message.clone(),
            };

            let slot = &mut queue.consumers[idx];
            if slot.tx.send(delivery).is_err() {
                // Receiver gone: drop the consumer and keep the message in place.
                queue.consumers.remove(idx);
                queue.cursor = 0;
                queue.ready.insert(key, queued);
                continue;
            }
            slot.in_flight += 1;
            let (consumer, session) = (slot.id, slot.session);
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer,
                    session,
                    queued,
                },
            );
        }
    }

    fn settle(&mut self, session: u64, tag: DeliveryTag) -> Result<Unacked> {
        match self.unacked.get(&tag) {
            Some(u) if u.session == session => {}
            _ => return Err(TransportError::UnknownDeliveryTag(tag.0)),
        }
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag(tag.0))?;
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.release_slot(unacked.consumer);
        }
        Ok(unacked)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(TransportError::Unreachable(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        state.next_session += 1;
        let id = state.next_session;
        let (tx, rx) = watch::channel(false);
        state.sessions.insert(id, tx);
        Ok(Arc::new(InMemorySession {
            broker: self.clone(),
            id,
            closed: rx,
        }))
    }
}

/// A session on an [`InMemoryBroker`].
pub struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_exchange(&self, decl: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        if decl.name == DEFAULT_EXCHANGE {
            return Err(TransportError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }
        match state.exchanges.get(&decl.name) {
            Some(existing) if existing != decl => Err(TransportError::PreconditionFailed(format!(
                "exchange '{}' already declared as {:?}",
                decl.name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(decl.name.clone(), decl.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, decl: &QueueDeclaration) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        match state.queues.get(&decl.name) {
            Some(existing) if existing.owner.is_some_and(|o| o != self.id) => {
                Err(TransportError::PreconditionFailed(format!(
                    "queue '{}' is exclusive to another session",
                    decl.name
                )))
            }
            Some(existing) if &existing.decl != decl => {
                Err(TransportError::PreconditionFailed(format!(
                    "queue '{}' already declared with different arguments",
                    decl.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                let owner = decl.exclusive.then_some(self.id);
                state
                    .queues
                    .insert(decl.name.clone(), QueueState::new(decl.clone(), owner));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        let kind = state
            .exchanges
            .get(&binding.exchange)
            .map(|e| e.kind)
            .ok_or_else(|| TransportError::ExchangeNotFound(binding.exchange.clone()))?;
        if !state.queues.contains_key(&binding.queue) {
            return Err(TransportError::QueueNotFound(binding.queue.clone()));
        }
        if kind == ExchangeKind::Headers && binding.header_match.is_none() {
            return Err(TransportError::PreconditionFailed(format!(
                "binding to headers exchange '{}' needs header match arguments",
                binding.exchange
            )));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        state.route(&self.broker, exchange, routing_key, message)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<DeliveryReceiver> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        state.next_consumer += 1;
        let consumer_id = state.next_consumer;

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        if q.owner.is_some_and(|o| o != self.id) {
            return Err(TransportError::PreconditionFailed(format!(
                "queue '{queue}' is exclusive to another session"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            id: consumer_id,
            session: self.id,
            tx,
            prefetch: options.prefetch,
            in_flight: 0,
        });
        q.had_consumer = true;
        state.pump(&self.broker, queue);
        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        let unacked = state.settle(self.id, tag)?;
        state.pump(&self.broker, &unacked.queue);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        state.ensure_open(self.id)?;
        let unacked = state.settle(self.id, tag)?;
        let queue_name = unacked.queue;
        let mut queued = unacked.queued;
        if requeue {
            queued.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.push_front(queued);
            }
        } else {
            state.dead_letter(&self.broker, &queue_name, queued, DeathReason::Rejected);
        }
        state.pump(&self.broker, &queue_name);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn close(&self) {
        let mut state = self.broker.state.lock().await;
        state.close_session(&self.broker, self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::topology::{HeaderMatch, MatchMode};

    async fn session(broker: &InMemoryBroker) -> Arc<dyn BrokerSession> {
        broker.connect().await.unwrap()
    }

    fn msg(message_type: &str) -> Message {
        Message::new(message_type, message_type.to_string())
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("orders"))
            .await
            .unwrap();

        s.publish("", "orders", msg("a")).await.unwrap();
        s.publish("", "missing", msg("b")).await.unwrap();

        assert_eq!(broker.queue_depth("orders").await, 1);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        let err = s.publish("nope", "k", msg("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn test_topic_routing_to_multiple_queues() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange(&ExchangeDeclaration::topic("events"))
            .await
            .unwrap();
        for q in ["all", "orders"] {
            s.declare_queue(&QueueDeclaration::durable(q)).await.unwrap();
        }
        s.bind_queue(&Binding::new("all", "events", "#"))
            .await
            .unwrap();
        s.bind_queue(&Binding::new("orders", "events", "order.*"))
            .await
            .unwrap();

        s.publish("events", "order.created", msg("a")).await.unwrap();
        s.publish("events", "payment.failed", msg("b")).await.unwrap();

        assert_eq!(broker.queue_depth("all").await, 2);
        assert_eq!(broker.queue_depth("orders").await, 1);
    }

    #[tokio::test]
    async fn test_headers_exchange_requires_match_arguments() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange(&ExchangeDeclaration::new("h", ExchangeKind::Headers))
            .await
            .unwrap();
        s.declare_queue(&QueueDeclaration::durable("eu"))
            .await
            .unwrap();

        let err = s.bind_queue(&Binding::new("eu", "h", "")).await.unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));

        let mut wanted = crate::message::Headers::new();
        wanted.insert("region".into(), "eu".into());
        s.bind_queue(&Binding::headers(
            "eu",
            "h",
            HeaderMatch {
                mode: MatchMode::All,
                headers: wanted,
            },
        ))
        .await
        .unwrap();

        let mut m = msg("a");
        m.set_header("region", "eu");
        s.publish("h", "", m).await.unwrap();
        s.publish("h", "", msg("b")).await.unwrap();
        assert_eq!(broker.queue_depth("eu").await, 1);
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        let err = s
            .declare_queue(&QueueDeclaration::durable("q").with_max_priority(3))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_priority_queue_delivers_highest_first() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("p").with_max_priority(5))
            .await
            .unwrap();

        for (name, prio) in [("low", 1), ("high", 9), ("mid", 3)] {
            let mut m = msg(name);
            m.priority = Some(prio);
            s.publish("", "p", m).await.unwrap();
        }

        let order: Vec<String> = broker
            .drain("p")
            .await
            .into_iter()
            .map(|m| m.message_type)
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_in_flight_deliveries() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        for i in 0..3 {
            s.publish("", "q", msg(&format!("m{i}"))).await.unwrap();
        }

        let mut rx = s.consume("q", &ConsumeOptions::with_prefetch(1)).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.message.message_type, "m0");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.unacked_count("q").await, 1);

        s.ack(first.tag).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message.message_type, "m1");
    }

    #[tokio::test]
    async fn test_nack_requeue_returns_to_front() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        s.publish("", "q", msg("first")).await.unwrap();
        s.publish("", "q", msg("second")).await.unwrap();

        let mut rx = s.consume("q", &ConsumeOptions::with_prefetch(1)).await.unwrap();
        let d = rx.recv().await.unwrap();
        s.nack(d.tag, true).await.unwrap();

        let again = rx.recv().await.unwrap();
        assert_eq!(again.message.message_type, "first");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_with_trail() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange(&ExchangeDeclaration::direct("dlx"))
            .await
            .unwrap();
        s.declare_queue(&QueueDeclaration::durable("dead"))
            .await
            .unwrap();
        s.bind_queue(&Binding::new("dead", "dlx", "work"))
            .await
            .unwrap();
        s.declare_queue(&QueueDeclaration::durable("work").with_dead_letter("dlx", None))
            .await
            .unwrap();

        s.publish("", "work", msg("job")).await.unwrap();
        let mut rx = s.consume("work", &ConsumeOptions::default()).await.unwrap();
        let d = rx.recv().await.unwrap();
        s.nack(d.tag, false).await.unwrap();

        let dead = broker.drain("dead").await;
        assert_eq!(dead.len(), 1);
        let trail = dead[0].deaths();
        assert_eq!(trail[0].queue, "work");
        assert_eq!(trail[0].reason, DeathReason::Rejected);
    }

    #[tokio::test]
    async fn test_reject_without_dead_letter_drops() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        s.publish("", "q", msg("job")).await.unwrap();
        let mut rx = s.consume("q", &ConsumeOptions::default()).await.unwrap();
        let d = rx.recv().await.unwrap();
        s.nack(d.tag, false).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, 0);
        assert_eq!(broker.unacked_count("q").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_dead_letters_to_target() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("work")).await.unwrap();
        s.declare_queue(
            &QueueDeclaration::durable("work.delay")
                .with_dead_letter("", Some("work".to_string())),
        )
        .await
        .unwrap();

        let mut m = msg("later");
        m.expiration = Some(Duration::from_millis(500));
        s.publish("", "work.delay", m).await.unwrap();
        assert_eq!(broker.queue_depth("work.delay").await, 1);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(broker.queue_depth("work").await, 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(broker.queue_depth("work.delay").await, 0);
        let arrived = broker.drain("work").await;
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].expiration, None);
        assert_eq!(arrived[0].deaths()[0].reason, DeathReason::Expired);
    }

    #[tokio::test]
    async fn test_session_close_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q")).await.unwrap();
        s.publish("", "q", msg("job")).await.unwrap();
        let mut rx = s.consume("q", &ConsumeOptions::default()).await.unwrap();
        let _ = rx.recv().await.unwrap();

        broker.fail_connections().await;
        assert!(!s.is_open());
        s.closed().await;
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.queue_depth("q").await, 1);

        let s2 = session(&broker).await;
        let mut rx2 = s2.consume("q", &ConsumeOptions::default()).await.unwrap();
        let d = rx2.recv().await.unwrap();
        assert!(d.redelivered);
        assert!(matches!(
            s.ack(d.tag).await,
            Err(TransportError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_with_session() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::exclusive("reply"))
            .await
            .unwrap();

        let other = session(&broker).await;
        assert!(other.consume("reply", &ConsumeOptions::default()).await.is_err());

        s.close().await;
        assert!(!broker.queue_exists("reply").await);
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        assert!(matches!(
            broker.connect().await,
            Err(TransportError::Unreachable(_))
        ));
        broker.set_reachable(true).await;
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_keeps_durable_state_only() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("durable"))
            .await
            .unwrap();
        s.declare_queue(&QueueDeclaration {
            durable: false,
            ..QueueDeclaration::durable("transient")
        })
        .await
        .unwrap();
        s.publish("", "durable", msg("kept")).await.unwrap();
        let mut lost = msg("lost");
        lost.persistent = false;
        s.publish("", "durable", lost).await.unwrap();

        broker.restart().await;

        assert!(broker.queue_exists("durable").await);
        assert!(!broker.queue_exists("transient").await);
        let left = broker.drain("durable").await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message_type, "kept");
    }

    #[tokio::test]
    async fn test_single_active_consumer() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue(&QueueDeclaration::durable("q").with_single_active_consumer())
            .await
            .unwrap();
        let mut first = s.consume("q", &ConsumeOptions::with_prefetch(10)).await.unwrap();
        let mut second = s.consume("q", &ConsumeOptions::with_prefetch(10)).await.unwrap();

        for i in 0..3 {
            s.publish("", "q", msg(&format!("m{i}"))).await.unwrap();
        }
        for i in 0..3 {
            assert_eq!(first.recv().await.unwrap().message.message_type, format!("m{i}"));
        }
        assert!(second.try_recv().is_err());
    }
}
