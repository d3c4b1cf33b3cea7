//! NATS JetStream transport
//!
//! Maps the exchange/queue model onto JetStream:
//! - an exchange becomes a file-backed stream capturing `<exchange>.>`
//! - a message published with routing key `k` goes to subject `<exchange>.<k>`
//! - a queue bound to an exchange becomes a durable pull consumer with
//!   explicit acks, filtered on the translated binding key
//!   (`#` → `>`, `*` stays `*`)
//!
//! The client's own reconnect loop is supplemented by treating the first
//! `Disconnected` event as connection loss, so the bus supervisor can replay
//! topology on a fresh connection.

use crate::message::{Acker, Delivery};
use crate::transport::{Connection, DeliveryStream, Session, Transport};
use crate::types::{BindDef, ExchangeDef, ExchangeKind, QueueDef};
use crate::{Error, Result};
use async_nats::jetstream::{
    self,
    consumer::{self, pull, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, StorageType},
    AckKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// JetStream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Prefix for stream names
    pub stream_prefix: String,

    /// Seconds JetStream waits for an ack before redelivering
    pub ack_wait_seconds: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "SETTLEMENT".to_string(),
            ack_wait_seconds: 30,
        }
    }
}

/// Dials NATS connections
pub struct NatsTransport {
    config: NatsConfig,
}

impl NatsTransport {
    /// Create transport
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let lost = CancellationToken::new();
        let on_event = lost.clone();

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let lost = on_event.clone();
                async move {
                    if let async_nats::Event::Disconnected = event {
                        lost.cancel();
                    }
                }
            })
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        info!("Connected to NATS at {}", self.config.url);

        Ok(Arc::new(NatsConnection {
            client,
            config: self.config.clone(),
            lost,
            routes: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

/// Where a queue's messages live
#[derive(Debug, Clone)]
struct QueueRoute {
    stream: String,
    exchange: String,
}

struct NatsConnection {
    client: async_nats::Client,
    config: NatsConfig,
    lost: CancellationToken,
    routes: Arc<RwLock<HashMap<String, QueueRoute>>>,
}

#[async_trait]
impl Connection for NatsConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if self.lost.is_cancelled() {
            return Err(Error::Closed("NATS connection lost".into()));
        }
        Ok(Box::new(NatsSession {
            context: jetstream::new(self.client.clone()),
            config: self.config.clone(),
            token: self.lost.child_token(),
            routes: self.routes.clone(),
            next_tag: AtomicU64::new(1),
        }))
    }

    fn is_closed(&self) -> bool {
        self.lost.is_cancelled()
    }

    async fn closed(&self) {
        self.lost.cancelled().await
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            warn!("Flush before close failed: {}", e);
        }
        self.lost.cancel();
    }
}

struct NatsSession {
    context: jetstream::Context,
    config: NatsConfig,
    token: CancellationToken,
    routes: Arc<RwLock<HashMap<String, QueueRoute>>>,
    next_tag: AtomicU64,
}

impl NatsSession {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Closed("session closed".into()))
        } else {
            Ok(())
        }
    }

    fn stream_name(&self, exchange: &str) -> String {
        format!("{}_{}", self.config.stream_prefix, sanitize(exchange)).to_uppercase()
    }
}

/// Stream and durable names may not contain `.`, `*`, `>` or whitespace
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// Translate an AMQP binding key into a NATS filter subject
fn filter_subject(exchange: &str, kind: ExchangeKind, binding_key: &str) -> Result<String> {
    if kind == ExchangeKind::Fanout {
        return Ok(format!("{}.>", exchange));
    }
    let words: Vec<&str> = binding_key.split('.').collect();
    let mut translated = Vec::with_capacity(words.len());
    for (i, word) in words.iter().enumerate() {
        match *word {
            "#" if i + 1 == words.len() => translated.push(">"),
            "#" => {
                return Err(Error::Topology(format!(
                    "'#' must be the last word of binding key {}",
                    binding_key
                )))
            }
            other => translated.push(other),
        }
    }
    Ok(format!("{}.{}", exchange, translated.join(".")))
}

#[async_trait]
impl Session for NatsSession {
    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()> {
        self.ensure_open()?;
        let config = StreamConfig {
            name: self.stream_name(&def.name),
            description: Some(format!("{} exchange {}", def.kind.as_str(), def.name)),
            subjects: vec![format!("{}.>", def.name)],
            storage: if def.durable {
                StorageType::File
            } else {
                StorageType::Memory
            },
            ..Default::default()
        };
        self.context
            .get_or_create_stream(config)
            .await
            .map_err(|e| Error::Topology(e.to_string()))?;
        Ok(())
    }

    async fn declare_queue(&self, _def: &QueueDef) -> Result<()> {
        // Materialised as a durable consumer when bound
        self.ensure_open()
    }

    async fn bind(&self, def: &BindDef) -> Result<()> {
        self.ensure_open()?;
        let stream_name = self.stream_name(&def.exchange);
        let stream = self
            .context
            .get_stream(&stream_name)
            .await
            .map_err(|e| Error::Topology(e.to_string()))?;

        let durable = sanitize(&def.queue);
        let config = pull::Config {
            durable_name: Some(durable.clone()),
            filter_subject: filter_subject(&def.exchange, ExchangeKind::Topic, &def.routing_key)?,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(self.config.ack_wait_seconds),
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };
        stream
            .get_or_create_consumer::<pull::Config>(&durable, config)
            .await
            .map_err(|e| Error::Topology(e.to_string()))?;

        self.routes.write().insert(
            def.queue.clone(),
            QueueRoute {
                stream: stream_name,
                exchange: def.exchange.clone(),
            },
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.context
            .publish(format!("{}.{}", exchange, routing_key), payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))?
            .await
            .map_err(|e| Error::Publish(format!("Publish ack failed: {}", e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let route = self
            .routes
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::Consume(format!("queue {} is not bound", queue)))?;

        let consumer: consumer::PullConsumer = self
            .context
            .get_stream(&route.stream)
            .await
            .map_err(|e| Error::Consume(e.to_string()))?
            .get_consumer(&sanitize(queue))
            .await
            .map_err(|e| Error::Consume(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Consume(e.to_string()))?;

        let token = self.token.clone();
        let prefix = format!("{}.", route.exchange);
        let exchange = route.exchange;
        let base_tag = self.next_tag.fetch_add(1 << 32, Ordering::Relaxed);
        let counter = Arc::new(AtomicU64::new(0));

        let stream = messages
            .take_until(async move { token.cancelled().await })
            .filter_map(move |item| {
                let prefix = prefix.clone();
                let exchange = exchange.clone();
                let counter = counter.clone();
                async move {
                    match item {
                        Ok(message) => {
                            let subject = message.subject.to_string();
                            let routing_key = subject
                                .strip_prefix(&prefix)
                                .unwrap_or(&subject)
                                .to_string();
                            let redelivered =
                                message.info().map(|i| i.delivered > 1).unwrap_or(false);
                            let body = message.payload.clone();
                            let tag = base_tag + counter.fetch_add(1, Ordering::Relaxed);
                            Some(Delivery::new(
                                tag,
                                exchange,
                                routing_key,
                                redelivered,
                                body,
                                Box::new(NatsAcker { message }),
                            ))
                        }
                        Err(e) => {
                            warn!("JetStream pull error: {}", e);
                            None
                        }
                    }
                }
            });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.token.cancel();
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_subject_translation() {
        assert_eq!(
            filter_subject("ledger", ExchangeKind::Topic, "ledger.batch").unwrap(),
            "ledger.ledger.batch"
        );
        assert_eq!(
            filter_subject("market", ExchangeKind::Topic, "market.#").unwrap(),
            "market.market.>"
        );
        assert_eq!(
            filter_subject("market", ExchangeKind::Topic, "*.pricing").unwrap(),
            "market.*.pricing"
        );
        assert_eq!(
            filter_subject("blocks", ExchangeKind::Fanout, "ignored").unwrap(),
            "blocks.>"
        );
        assert!(filter_subject("market", ExchangeKind::Topic, "#.pricing").is_err());
    }

    #[test]
    fn test_sanitize_names() {
        assert_eq!(sanitize("reward.distribution"), "reward_distribution");
        assert_eq!(sanitize("market.*"), "market__");
    }

    #[test]
    fn test_config_default() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.ack_wait_seconds, 30);
    }
}
