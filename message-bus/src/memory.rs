//! In-process broker
//!
//! Implements the transport traits entirely in memory with AMQP-like
//! semantics: named exchanges route into durable queues through bindings,
//! deliveries stay unacknowledged until settled, and anything unsettled
//! when its session or connection goes away is requeued and marked
//! redelivered. [`MemoryBroker::sever`] drops every live connection and
//! [`MemoryBroker::reset`] additionally forgets all topology, which lets
//! reconnect and topology replay be exercised without an external broker.

use crate::message::{Acker, Delivery};
use crate::transport::{Connection, DeliveryStream, Session, Transport};
use crate::types::{BindDef, ExchangeDef, QueueDef};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Bytes,
    redelivered: bool,
}

struct MemoryQueue {
    ready: Mutex<VecDeque<StoredMessage>>,
    unacked: Mutex<HashMap<u64, StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            unacked: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: StoredMessage) {
        self.ready.lock().push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, tag: u64) -> bool {
        let Some(mut message) = self.unacked.lock().remove(&tag) else {
            return false;
        };
        message.redelivered = true;
        self.ready.lock().push_front(message);
        self.notify.notify_one();
        true
    }
}

struct BrokerState {
    exchanges: RwLock<HashMap<String, ExchangeDef>>,
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
    bindings: RwLock<Vec<BindDef>>,
    connections: Mutex<Vec<CancellationToken>>,
    available: AtomicBool,
    next_tag: AtomicU64,
    connects: AtomicU64,
}

/// In-process broker; clones share the same state
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Empty broker accepting connections
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                exchanges: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                bindings: RwLock::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Drop every live connection; unacknowledged deliveries are requeued
    pub fn sever(&self) {
        let live: Vec<_> = self.state.connections.lock().drain(..).collect();
        debug!("Severing {} in-memory connections", live.len());
        for token in live {
            token.cancel();
        }
    }

    /// Sever connections and forget all exchanges, queues, bindings and messages
    pub fn reset(&self) {
        self.sever();
        self.state.exchanges.write().clear();
        self.state.queues.write().clear();
        self.state.bindings.write().clear();
    }

    /// Refuse (`false`) or accept (`true`) new connections
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Messages waiting in `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .read()
            .get(queue)
            .map(|q| q.ready.lock().len())
            .unwrap_or(0)
    }

    /// Delivered but unsettled messages in `queue`
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .queues
            .read()
            .get(queue)
            .map(|q| q.unacked.lock().len())
            .unwrap_or(0)
    }

    /// Whether `name` is currently declared
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.exchanges.read().contains_key(name)
    }

    /// Whether `name` is currently declared
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.read().contains_key(name)
    }

    /// Number of bindings currently declared
    pub fn binding_count(&self) -> usize {
        self.state.bindings.read().len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(Error::Connection("in-memory broker unavailable".into()));
        }
        let token = CancellationToken::new();
        {
            let mut live = self.state.connections.lock();
            live.retain(|t| !t.is_cancelled());
            live.push(token.clone());
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            token,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    token: CancellationToken,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        if self.token.is_cancelled() {
            return Err(Error::Closed("connection closed".into()));
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            token: self.token.child_token(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    async fn close(&self) {
        self.token.cancel();
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    token: CancellationToken,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Closed("session closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()> {
        self.ensure_open()?;
        let mut exchanges = self.state.exchanges.write();
        match exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => Err(Error::Topology(format!(
                "exchange {} already declared as {}",
                def.name,
                existing.kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDef) -> Result<()> {
        self.ensure_open()?;
        self.state
            .queues
            .write()
            .entry(def.name.clone())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        Ok(())
    }

    async fn bind(&self, def: &BindDef) -> Result<()> {
        self.ensure_open()?;
        if !self.state.exchanges.read().contains_key(&def.exchange) {
            return Err(Error::Topology(format!("no exchange {}", def.exchange)));
        }
        if !self.state.queues.read().contains_key(&def.queue) {
            return Err(Error::Topology(format!("no queue {}", def.queue)));
        }
        let mut bindings = self.state.bindings.write();
        if !bindings.contains(def) {
            bindings.push(def.clone());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let kind = self
            .state
            .exchanges
            .read()
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| Error::Publish(format!("no exchange {}", exchange)))?;

        let targets: HashSet<String> = self
            .state
            .bindings
            .read()
            .iter()
            .filter(|b| b.exchange == exchange && kind.routes(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let queues = self.state.queues.read();
        for name in targets {
            if let Some(queue) = queues.get(&name) {
                queue.push(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: payload.clone(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let target = self
            .state
            .queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::Consume(format!("no queue {}", queue)))?;

        let subscription = Arc::new(Subscription {
            queue: target,
            state: self.state.clone(),
            token: self.token.clone(),
            outstanding: Mutex::new(HashSet::new()),
        });

        // Requeue whatever this subscription still holds once its session dies
        let watcher = subscription.clone();
        tokio::spawn(async move {
            watcher.token.cancelled().await;
            let tags: Vec<u64> = watcher.outstanding.lock().drain().collect();
            for tag in tags {
                watcher.queue.requeue(tag);
            }
        });

        let stream = futures::stream::unfold(subscription, |sub| async move {
            loop {
                if sub.token.is_cancelled() {
                    return None;
                }
                if let Some(delivery) = sub.next_ready() {
                    return Some((delivery, sub));
                }
                tokio::select! {
                    _ = sub.queue.notify.notified() => {}
                    _ = sub.token.cancelled() => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.token.cancel();
    }
}

struct Subscription {
    queue: Arc<MemoryQueue>,
    state: Arc<BrokerState>,
    token: CancellationToken,
    outstanding: Mutex<HashSet<u64>>,
}

impl Subscription {
    fn next_ready(self: &Arc<Self>) -> Option<Delivery> {
        let message = self.queue.ready.lock().pop_front()?;
        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst);
        self.queue.unacked.lock().insert(tag, message.clone());
        self.outstanding.lock().insert(tag);

        let acker = MemoryAcker {
            subscription: self.clone(),
            tag,
        };
        Some(Delivery::new(
            tag,
            message.exchange,
            message.routing_key,
            message.redelivered,
            message.body,
            Box::new(acker),
        ))
    }
}

struct MemoryAcker {
    subscription: Arc<Subscription>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.subscription.token.is_cancelled() {
            return Err(Error::Closed(format!(
                "session closed before settling delivery {}",
                self.tag
            )));
        }
        if !self.subscription.outstanding.lock().remove(&self.tag) {
            return Err(Error::Ack(format!("unknown delivery tag {}", self.tag)));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.subscription.queue.unacked.lock().remove(&self.tag);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        if requeue {
            self.subscription.queue.requeue(self.tag);
        } else {
            self.subscription.queue.unacked.lock().remove(&self.tag);
        }
        Ok(())
    }
}
