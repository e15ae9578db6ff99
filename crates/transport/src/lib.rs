//! Broker transport for the messaging core.
//!
//! This crate provides:
//! - The message envelope and its wire headers
//! - Exchange/queue/binding declarations and routing rules
//! - The [`Broker`] seam and an [`InMemoryBroker`] implementation
//! - A self-healing [`Connection`], a [`Publisher`] and consumer dispatch
//! - Type-based routing and request/reply correlation

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod router;
pub mod rpc;
pub mod topology;

pub use broker::{
    Broker, BrokerSession, ConsumeOptions, Delivery, DeliveryReceiver, DeliveryTag,
};
pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
pub use consumer::{DeliveryContext, FnHandler, MessageHandler, Outcome, handler_fn};
pub use error::{HandlerError, Result, TransportError};
pub use memory::InMemoryBroker;
pub use message::{DeathReason, DeathRecord, Headers, Message, MessageBuilder, headers};
pub use publisher::{PublishOptions, Publisher};
pub use router::Router;
pub use rpc::{Responder, RpcClient, RpcConfig, RpcError};
pub use topology::{
    Binding, DEFAULT_EXCHANGE, ExchangeDeclaration, ExchangeKind, HeaderMatch, MatchMode,
    QueueDeclaration, Topology, topic_matches,
};
