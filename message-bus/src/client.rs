//! Broker client
//!
//! Owns the connection, the session pool and the recorded topology. A
//! supervisor task waits for the connection to drop, then redials with
//! exponential backoff (1s doubling up to 30s by default, retrying forever),
//! replays every declared exchange, queue and binding on the new connection
//! and finally rebuilds the session pool. Publishes are not buffered while
//! disconnected; they fail and the caller decides what to do.

use crate::metrics::{
    CONNECTION_STATUS, MESSAGE_PUBLISH_DURATION, MESSAGE_PUBLISH_TOTAL, RECONNECT_ATTEMPTS,
};
use crate::pool::SessionPool;
use crate::subscriber::{run_worker, subscribe, ConsumerHandle, DeliveryHandler};
use crate::topology::Topology;
use crate::transport::{Connection, Transport};
use crate::types::{BindDef, ExchangeDef, QueueDef};
use crate::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sessions kept in the pool
    pub pool_size: usize,

    /// First reconnect delay
    pub reconnect_initial_ms: u64,

    /// Reconnect delay ceiling
    pub reconnect_max_ms: u64,

    /// Delay growth factor between reconnect attempts
    pub reconnect_multiplier: f64,

    /// Pause between resubscribe attempts after a consumer lost its session
    pub resubscribe_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            resubscribe_delay_ms: 1_000,
        }
    }
}

impl ClientConfig {
    /// Reconnect schedule: no jitter, no overall deadline
    pub fn reconnect_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.reconnect_initial_ms))
            .with_multiplier(self.reconnect_multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_millis(self.reconnect_max_ms))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Pause between resubscribe attempts
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

pub(crate) struct ClientInner {
    transport: Arc<dyn Transport>,
    pub(crate) pool: SessionPool,
    pub(crate) config: ClientConfig,
    topology: Mutex<Topology>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Broker client; clones share one connection
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    /// Connect and start the reconnect supervisor
    pub async fn connect(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        info!("Connecting to {} broker", transport.name());
        let connection = transport.connect().await?;
        let pool = SessionPool::new(config.pool_size);
        pool.rebuild(connection).await?;
        CONNECTION_STATUS.with_label_values(&["connected"]).inc();

        let inner = Arc::new(ClientInner {
            transport,
            pool,
            config,
            topology: Mutex::new(Topology::new()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(supervise(inner.clone()));
        *inner.supervisor.lock() = Some(handle);

        info!("✅ Broker client ready ({} pooled sessions)", inner.pool.idle());
        Ok(Self { inner })
    }

    /// Whether a live connection is installed
    pub fn is_connected(&self) -> bool {
        self.inner
            .pool
            .connection()
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    /// Snapshot of recorded declarations
    pub fn topology(&self) -> Topology {
        self.inner.topology.lock().clone()
    }

    /// Session pool
    pub fn pool(&self) -> &SessionPool {
        &self.inner.pool
    }

    /// Declare an exchange and record it for replay
    pub async fn declare_exchange(&self, def: ExchangeDef) -> Result<()> {
        let session = self.inner.pool.get().await?;
        let result = session.declare_exchange(&def).await;
        self.inner.pool.put(session).await;
        result?;
        self.inner.topology.lock().record_exchange(def);
        Ok(())
    }

    /// Declare a queue and record it for replay
    pub async fn declare_queue(&self, def: QueueDef) -> Result<()> {
        let session = self.inner.pool.get().await?;
        let result = session.declare_queue(&def).await;
        self.inner.pool.put(session).await;
        result?;
        self.inner.topology.lock().record_queue(def);
        Ok(())
    }

    /// Bind a queue and record the binding for replay
    pub async fn bind(&self, def: BindDef) -> Result<()> {
        let session = self.inner.pool.get().await?;
        let result = session.bind(&def).await;
        self.inner.pool.put(session).await;
        result?;
        self.inner.topology.lock().record_binding(def);
        Ok(())
    }

    /// Publish a raw payload
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let start = Instant::now();
        let result = match self.inner.pool.get().await {
            Ok(session) => {
                let result = session.publish(exchange, routing_key, payload.into()).await;
                self.inner.pool.put(session).await;
                result
            }
            Err(e) => Err(e),
        };

        MESSAGE_PUBLISH_DURATION
            .with_label_values(&[exchange])
            .observe(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[exchange, status])
            .inc();

        result
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(exchange, routing_key, payload).await
    }

    /// Start `workers` subscriptions on `queue`, each feeding `handler`
    pub async fn consume(
        &self,
        queue: &str,
        workers: usize,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let token = self.inner.shutdown.child_token();
        let mut tasks = Vec::with_capacity(workers.max(1));

        for worker in 0..workers.max(1) {
            let (session, stream) = match subscribe(&self.inner, queue).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    token.cancel();
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(e);
                }
            };
            tasks.push(tokio::spawn(run_worker(
                self.inner.clone(),
                queue.to_string(),
                worker,
                session,
                stream,
                handler.clone(),
                token.clone(),
            )));
        }

        info!("Consuming {} with {} workers", queue, tasks.len());
        Ok(ConsumerHandle::new(queue.to_string(), token, tasks))
    }

    /// Stop consumers and the supervisor, close pooled sessions and the connection
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!("Broker supervisor ended abnormally: {}", e);
            }
        }
        let connection = self.inner.pool.connection();
        self.inner.pool.drain().await;
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!("Broker client closed");
    }
}

async fn supervise(inner: Arc<ClientInner>) {
    loop {
        let Some(connection) = inner.pool.connection() else {
            return;
        };
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = connection.closed() => {}
        }
        CONNECTION_STATUS.with_label_values(&["disconnected"]).inc();
        warn!("⚠️  Broker connection lost, reconnecting");

        if !reconnect(&inner).await {
            return;
        }
    }
}

/// Redial until connected or shut down; returns false on shutdown
async fn reconnect(inner: &ClientInner) -> bool {
    let mut backoff = inner.config.reconnect_backoff();
    let ceiling = Duration::from_millis(inner.config.reconnect_max_ms);
    let mut attempt: u64 = 0;

    loop {
        let delay = backoff.next_backoff().unwrap_or(ceiling);
        tokio::select! {
            _ = inner.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
        RECONNECT_ATTEMPTS.inc();

        let connection = match inner.transport.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                continue;
            }
        };

        match restore(inner, connection.clone()).await {
            Ok(()) => {
                CONNECTION_STATUS.with_label_values(&["connected"]).inc();
                info!("✅ Reconnected after {} attempts", attempt);
                return true;
            }
            Err(e) => {
                error!("Topology restore failed after reconnect: {}", e);
                connection.close().await;
            }
        }
    }
}

/// Replay topology on `connection`, then rebuild the pool on it
async fn restore(inner: &ClientInner, connection: Arc<dyn Connection>) -> Result<()> {
    let topology = inner.topology.lock().clone();
    let session = connection.open_session().await?;
    let replayed = topology.replay(session.as_ref()).await;
    session.close().await;
    replayed?;
    info!(
        "Replayed {} exchanges, {} queues, {} bindings",
        topology.exchanges().len(),
        topology.queues().len(),
        topology.bindings().len()
    );
    inner.pool.rebuild(connection).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let config = ClientConfig::default();
        let mut backoff = config.reconnect_backoff();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.reconnect_initial_ms, 1_000);
        assert_eq!(config.reconnect_max_ms, 30_000);
    }
}
