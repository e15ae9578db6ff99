//! Broker connection with bounded reconnection.
//!
//! A [`Connection`] owns at most one open [`BrokerSession`]. It records every
//! declaration and consumer registration so that, after the session drops, a
//! supervisor task can reconnect with a fixed delay, replay the topology and
//! re-subscribe every consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use common::MessageId;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerSession, ConsumeOptions};
use crate::consumer::{self, MessageHandler};
use crate::message::{Message, headers};
use crate::publisher::{PublishOptions, Publisher};
use crate::topology::{Binding, ExchangeDeclaration, QueueDeclaration, Topology};
use crate::{Result, TransportError};

/// Reconnection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fixed delay before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Attempts made before the connection is declared unavailable.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection gave up; only an explicit `connect()` leaves this state.
    Unavailable,
}

/// Lifecycle notification published by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Fatal: reconnection attempts are exhausted.
    Unavailable { attempts: u32 },
}

struct Registration {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    options: ConsumeOptions,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    topology: Mutex<Topology>,
    consumers: Mutex<Vec<Registration>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    closing: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A logical, self-healing connection to the broker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a disconnected connection to `broker`.
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                session: RwLock::new(None),
                topology: Mutex::new(Topology::new()),
                consumers: Mutex::new(Vec::new()),
                state,
                events,
                closing: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Establishes the connection, replaying recorded topology and consumers.
    ///
    /// A failed first attempt falls back to the bounded reconnection loop;
    /// returns `Unavailable` once it gives up.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closing.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "initial connection failed");
                self.reconnect_loop()
                    .await
                    .ok_or(TransportError::Unavailable {
                        attempts: self.inner.config.max_reconnect_attempts,
                    })?
            }
        };

        self.emit(ConnectionEvent::Connected);
        tracing::info!("connected to broker");
        self.spawn_supervisor(session).await;
        Ok(())
    }

    /// Closes the session and stops reconnection. Recorded topology and
    /// consumers are kept for a later `connect()`.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            handle.abort();
        }
        if let Some(session) = self.inner.session.write().await.take() {
            session.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            reason: "closed by client".to_string(),
        });
        tracing::info!("disconnected from broker");
    }

    /// Returns true while a session is open.
    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Returns a publisher sharing this connection.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.clone())
    }

    /// Returns a copy of the recorded topology.
    pub async fn topology(&self) -> Topology {
        self.inner.topology.lock().await.clone()
    }

    /// Declares an exchange now (if connected) and on every reconnect.
    pub async fn declare_exchange(&self, decl: ExchangeDeclaration) -> Result<()> {
        self.inner.topology.lock().await.add_exchange(decl.clone());
        if let Some(session) = self.session().await {
            session.declare_exchange(&decl).await?;
        }
        Ok(())
    }

    /// Declares a queue now (if connected) and on every reconnect.
    pub async fn declare_queue(&self, decl: QueueDeclaration) -> Result<()> {
        self.inner.topology.lock().await.add_queue(decl.clone());
        if let Some(session) = self.session().await {
            session.declare_queue(&decl).await?;
        }
        Ok(())
    }

    /// Binds a queue now (if connected) and on every reconnect.
    pub async fn bind_queue(&self, binding: Binding) -> Result<()> {
        self.inner.topology.lock().await.add_binding(binding.clone());
        if let Some(session) = self.session().await {
            session.bind_queue(&binding).await?;
        }
        Ok(())
    }

    /// Declares a whole topology, exchanges first.
    pub async fn declare_topology(&self, topology: Topology) -> Result<()> {
        for e in topology.exchanges {
            self.declare_exchange(e).await?;
        }
        for q in topology.queues {
            self.declare_queue(q).await?;
        }
        for b in topology.bindings {
            self.bind_queue(b).await?;
        }
        Ok(())
    }

    /// Publishes a message.
    ///
    /// Assigns a message id when absent and stamps `x-timestamp`. Fails fast
    /// with `NotConnected` while no session is open.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut message: Message,
        options: PublishOptions,
    ) -> Result<()> {
        let session = self.session().await.ok_or(TransportError::NotConnected)?;

        options.apply(&mut message);
        message.id.get_or_insert_with(MessageId::new);
        if message.header(headers::TIMESTAMP).is_none() {
            message.set_header(headers::TIMESTAMP, Utc::now().to_rfc3339());
        }
        let message_type = message.message_type.clone();

        if let Err(e) = session.publish(exchange, routing_key, message).await {
            tracing::warn!(exchange, routing_key, %message_type, error = %e, "publish failed");
            return Err(e);
        }
        metrics::counter!("messages_published_total", "exchange" => exchange.to_string())
            .increment(1);
        tracing::debug!(exchange, routing_key, %message_type, "message published");
        Ok(())
    }

    /// Registers `handler` for every delivery from `queue`.
    ///
    /// Starts consuming immediately when connected; the registration is
    /// re-subscribed after every reconnect.
    pub async fn consume<H>(&self, queue: &str, handler: H, options: ConsumeOptions) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.consume_arc(queue, Arc::new(handler), options).await
    }

    /// Like [`consume`](Self::consume) for a shared handler.
    pub async fn consume_arc(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<()> {
        let registration = Registration {
            queue: queue.to_string(),
            handler,
            options,
        };
        let mut consumers = self.inner.consumers.lock().await;
        if let Some(session) = self.session().await {
            self.start_consumer(&session, &registration).await?;
        }
        consumers.push(registration);
        Ok(())
    }

    pub(crate) async fn session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_open())
            .cloned()
    }

    async fn start_consumer(
        &self,
        session: &Arc<dyn BrokerSession>,
        registration: &Registration,
    ) -> Result<()> {
        let rx = session
            .consume(&registration.queue, &registration.options)
            .await?;
        let tag = registration
            .options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| registration.queue.clone());
        consumer::spawn_dispatch(
            session.clone(),
            rx,
            registration.handler.clone(),
            self.publisher(),
            tag,
        );
        Ok(())
    }

    /// Opens a session, replays topology and re-subscribes consumers.
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>> {
        let session = self.inner.broker.connect().await?;
        if let Err(e) = self.establish(&session).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn establish(&self, session: &Arc<dyn BrokerSession>) -> Result<()> {
        let topology = self.inner.topology.lock().await.clone();
        for e in &topology.exchanges {
            session.declare_exchange(e).await?;
        }
        for q in &topology.queues {
            session.declare_queue(q).await?;
        }
        for b in &topology.bindings {
            session.bind_queue(b).await?;
        }

        let consumers = self.inner.consumers.lock().await;
        *self.inner.session.write().await = Some(session.clone());
        for registration in consumers.iter() {
            if let Err(e) = self.start_consumer(session, registration).await {
                self.inner.session.write().await.take();
                return Err(e);
            }
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Retries with a fixed delay. Returns `None` once attempts are exhausted
    /// or the connection is being closed.
    async fn reconnect_loop(&self) -> Option<Arc<dyn BrokerSession>> {
        let max = self.inner.config.max_reconnect_attempts;
        for attempt in 1..=max {
            if self.inner.closing.load(Ordering::SeqCst) {
                return None;
            }
            self.set_state(ConnectionState::Reconnecting);
            self.emit(ConnectionEvent::Reconnecting { attempt });
            tracing::info!(
                attempt,
                max_attempts = max,
                delay_ms = self.inner.config.reconnect_delay.as_millis() as u64,
                "reconnecting to broker"
            );
            tokio::time::sleep(self.inner.config.reconnect_delay).await;

            match self.open_session().await {
                Ok(session) => {
                    metrics::counter!("connection_reconnects_total").increment(1);
                    return Some(session);
                }
                Err(e) => tracing::warn!(attempt, error = %e, "reconnection attempt failed"),
            }
        }

        self.set_state(ConnectionState::Unavailable);
        self.emit(ConnectionEvent::Unavailable { attempts: max });
        tracing::error!(attempts = max, "broker unavailable, giving up on reconnection");
        None
    }

    async fn spawn_supervisor(&self, session: Arc<dyn BrokerSession>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut session = session;
            loop {
                session.closed().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let conn = Connection { inner };
                if conn.inner.closing.load(Ordering::SeqCst) {
                    return;
                }

                conn.inner.session.write().await.take();
                conn.set_state(ConnectionState::Disconnected);
                conn.emit(ConnectionEvent::Disconnected {
                    reason: "session closed unexpectedly".to_string(),
                });
                tracing::warn!("broker session lost");

                match conn.reconnect_loop().await {
                    Some(next) => {
                        conn.emit(ConnectionEvent::Reconnected);
                        tracing::info!("reconnected to broker");
                        session = next;
                    }
                    None => return,
                }
            }
        });
        if let Some(previous) = self.inner.supervisor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let broker = InMemoryBroker::new();
        let conn = Connection::new(Arc::new(broker.clone()), config());
        assert!(!conn.is_connected());

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(broker.session_count().await, 1);

        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let conn = Connection::new(Arc::new(InMemoryBroker::new()), config());
        let err = conn
            .publish("", "q", Message::new("t", ""), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_assigns_id_and_timestamp() {
        let broker = InMemoryBroker::new();
        let conn = Connection::new(Arc::new(broker.clone()), config());
        conn.declare_queue(QueueDeclaration::durable("q"))
            .await
            .unwrap();
        conn.connect().await.unwrap();

        conn.publish("", "q", Message::new("t", "x"), PublishOptions::default())
            .await
            .unwrap();

        let stored = broker.drain("q").await;
        assert!(stored[0].id.is_some());
        assert!(stored[0].timestamp().is_some());
    }

    #[tokio::test]
    async fn test_topology_declared_before_connect_is_applied() {
        let broker = InMemoryBroker::new();
        let conn = Connection::new(Arc::new(broker.clone()), config());
        conn.declare_queue(QueueDeclaration::durable("orders"))
            .await
            .unwrap();
        assert!(!broker.queue_exists("orders").await);

        conn.connect().await.unwrap();
        assert!(broker.queue_exists("orders").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false).await;
        let conn = Connection::new(Arc::new(broker), config());
        let mut events = conn.subscribe_events();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable { attempts: 3 }));
        assert_eq!(conn.state(), ConnectionState::Unavailable);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.last(),
            Some(&ConnectionEvent::Unavailable { attempts: 3 })
        );
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, ConnectionEvent::Reconnecting { .. }))
                .count(),
            3
        );
    }
}
