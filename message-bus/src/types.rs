//! Type definitions for message bus

use serde::{Deserialize, Serialize};

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routing key matched against dotted binding patterns (`*`, `#`)
    Topic,
    /// Routing key must equal the binding key
    Direct,
    /// Every bound queue receives every message
    Fanout,
}

impl ExchangeKind {
    /// Broker-facing name
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// Whether a message published with `routing_key` reaches a queue bound with `binding_key`
    pub fn routes(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        }
    }
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeDef {
    /// Exchange name
    pub name: String,
    /// Routing behaviour
    pub kind: ExchangeKind,
    /// Survives broker restarts
    pub durable: bool,
}

impl ExchangeDef {
    /// Durable topic exchange
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Queue declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDef {
    /// Queue name
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted once the last consumer goes away
    pub auto_delete: bool,
}

impl QueueDef {
    /// Durable, non auto-delete queue
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue-to-exchange binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindDef {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Binding key (pattern for topic exchanges)
    pub routing_key: String,
}

impl BindDef {
    /// Create binding
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// AMQP-style topic match: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}
