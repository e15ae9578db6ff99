//! Exchange, queue and binding declarations.
//!
//! Declarations are plain values so the connection can record them and
//! replay the whole topology after a reconnect.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::Headers;

/// The nameless exchange that routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing topology of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a dot-separated pattern with `*` and `#` wildcards.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
    /// Routing by header values instead of routing key.
    Headers,
}

/// Declaration of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDeclaration {
    /// Creates a durable exchange declaration.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }

    /// Creates a durable topic exchange declaration.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    /// Creates a durable direct exchange declaration.
    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    /// Creates a durable fanout exchange declaration.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }
}

/// Declaration of a queue and its broker-side arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring session; deleted when that session closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
    /// Enables priority ordering, clamping message priorities to this value.
    pub max_priority: Option<u8>,
    /// Exchange receiving rejected and expired messages.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering; the original key when unset.
    pub dead_letter_routing_key: Option<String>,
    /// Time to live applied to every message in the queue.
    pub message_ttl: Option<Duration>,
    /// Only one consumer receives deliveries at a time.
    pub single_active_consumer: bool,
}

impl QueueDeclaration {
    /// Creates a durable queue declaration with no arguments.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            single_active_consumer: false,
        }
    }

    /// Creates a transient, exclusive, auto-delete queue (reply queues).
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Self::durable(name)
        }
    }

    /// Sets the max-priority ceiling.
    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    /// Routes rejected and expired messages to `exchange`.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    /// Sets the queue-wide message TTL.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Restricts delivery to a single active consumer.
    pub fn with_single_active_consumer(mut self) -> Self {
        self.single_active_consumer = true;
        self
    }
}

/// How a headers binding combines its match entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    /// Every entry must match (`x-match = all`).
    All,
    /// At least one entry must match (`x-match = any`).
    Any,
}

/// Header matching arguments of a binding to a headers exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    pub mode: MatchMode,
    pub headers: Headers,
}

impl HeaderMatch {
    /// Returns true if `headers` satisfy this match.
    pub fn matches(&self, headers: &Headers) -> bool {
        let mut entries = self
            .headers
            .iter()
            .map(|(k, v)| headers.get(k) == Some(v));
        match self.mode {
            MatchMode::All => entries.all(|m| m),
            MatchMode::Any => entries.any(|m| m),
        }
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    /// Binding key or topic pattern; ignored by fanout and headers exchanges.
    pub routing_key: String,
    /// Required for headers exchanges.
    pub header_match: Option<HeaderMatch>,
}

impl Binding {
    /// Creates a routing-key binding.
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            header_match: None,
        }
    }

    /// Creates a binding to a headers exchange.
    pub fn headers(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        header_match: HeaderMatch,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
            header_match: Some(header_match),
        }
    }

    /// Returns true if a message published with `routing_key` and `headers`
    /// to an exchange of `kind` should reach this binding's queue.
    pub fn matches(&self, kind: ExchangeKind, routing_key: &str, headers: &Headers) -> bool {
        match kind {
            ExchangeKind::Direct => self.routing_key == routing_key,
            ExchangeKind::Topic => topic_matches(&self.routing_key, routing_key),
            ExchangeKind::Fanout => true,
            ExchangeKind::Headers => self
                .header_match
                .as_ref()
                .is_some_and(|m| m.matches(headers)),
        }
    }
}

/// Matches a routing key against a topic pattern.
///
/// Words are dot-separated; `*` matches exactly one word and `#` matches zero
/// or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) => (word == "*" || word == *first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// The set of declarations a connection replays on every (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeDeclaration>,
    pub queues: Vec<QueueDeclaration>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an exchange, replacing a previous declaration of the same name.
    pub fn add_exchange(&mut self, decl: ExchangeDeclaration) {
        self.exchanges.retain(|e| e.name != decl.name);
        self.exchanges.push(decl);
    }

    /// Records a queue, replacing a previous declaration of the same name.
    pub fn add_queue(&mut self, decl: QueueDeclaration) {
        self.queues.retain(|q| q.name != decl.name);
        self.queues.push(decl);
    }

    /// Records a binding unless an identical one exists.
    pub fn add_binding(&mut self, binding: Binding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Merges another topology into this one.
    pub fn merge(&mut self, other: Topology) {
        for e in other.exchanges {
            self.add_exchange(e);
        }
        for q in other.queues {
            self.add_queue(q);
        }
        for b in other.bindings {
            self.add_binding(b);
        }
    }

    /// Returns true if nothing has been declared.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}
