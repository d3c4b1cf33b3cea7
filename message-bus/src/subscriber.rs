//! Queue consumers
//!
//! `consume(queue, workers, handler)` starts `workers` independent
//! subscriptions on the same queue, each on its own pooled session. The
//! handler owns the acknowledgment decision for every delivery. When a
//! subscription ends because the connection dropped, the worker returns its
//! session and keeps trying to resubscribe until the consumer is cancelled.

use crate::client::ClientInner;
use crate::message::Delivery;
use crate::metrics::{MESSAGE_PROCESS_DURATION, MESSAGE_RECEIVE_TOTAL};
use crate::transport::{DeliveryStream, Session};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivery handler trait
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handle one delivery; must `ack` or `nack` it
    async fn handle(&self, delivery: Delivery);
}

/// Running consumer on one queue
pub struct ConsumerHandle {
    queue: String,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerHandle {
    pub(crate) fn new(queue: String, token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            queue,
            token,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queue being consumed
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop taking new deliveries; in-flight handlers run to completion
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the consumer was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for every worker to exit
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Consumer worker on {} ended abnormally: {}", self.queue, e);
            }
        }
    }

    /// Cancel and wait
    pub async fn stop(&self) {
        self.cancel();
        self.join().await;
    }
}

/// Open a session and subscribe it to `queue`
pub(crate) async fn subscribe(
    inner: &ClientInner,
    queue: &str,
) -> Result<(Box<dyn Session>, DeliveryStream)> {
    let session = inner.pool.get().await?;
    match session.consume(queue).await {
        Ok(stream) => Ok((session, stream)),
        Err(e) => {
            inner.pool.put(session).await;
            Err(e)
        }
    }
}

/// Worker loop for one subscription slot
pub(crate) async fn run_worker(
    inner: Arc<ClientInner>,
    queue: String,
    worker: usize,
    mut session: Box<dyn Session>,
    mut stream: DeliveryStream,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
) {
    debug!("Consumer worker {} started on {}", worker, queue);

    loop {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => item,
            };
            let Some(delivery) = next else { break };

            MESSAGE_RECEIVE_TOTAL.with_label_values(&[queue.as_str()]).inc();
            let start = Instant::now();
            handler.handle(delivery).await;
            MESSAGE_PROCESS_DURATION
                .with_label_values(&[queue.as_str()])
                .observe(start.elapsed().as_secs_f64());
        }

        drop(stream);
        inner.pool.put(session).await;

        if token.is_cancelled() {
            debug!("Consumer worker {} on {} stopped", worker, queue);
            return;
        }

        warn!(
            "Consumer worker {} lost its subscription on {}, resubscribing",
            worker, queue
        );

        (session, stream) = loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(inner.config.resubscribe_delay()) => {}
            }
            match subscribe(&inner, &queue).await {
                Ok(subscription) => break subscription,
                Err(e) => debug!("Resubscribe to {} failed: {}", queue, e),
            }
        };
        info!("Consumer worker {} resubscribed to {}", worker, queue);
    }
}
