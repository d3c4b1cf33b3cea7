//! Idempotent worker-pool consumer
//!
//! One generic component carries the delivery pattern shared by every
//! settlement consumer:
//!
//! 1. `delivery_workers` broker subscriptions decode each message. Malformed
//!    payloads are nacked without requeue.
//! 2. Events already applied (per the processor's idempotency store) are
//!    acked and discarded.
//! 3. Everything else goes onto a bounded internal queue with a
//!    non-blocking send, and the broker message is acked as soon as the
//!    event is queued. A crash after that point loses the event.
//! 4. `processing_workers` drain the queue, applying each event under a
//!    per-item deadline.
//! 5. A full queue parks the event in a keyed retry store (or skips it, per
//!    [`OverflowPolicy`]). Failed or timed-out events are parked the same
//!    way. A scavenger re-enqueues parked events every `retry_interval`
//!    and drops an event once it has been retried `max_retry_attempts`
//!    times.

use crate::config::PoolConfig;
use crate::metrics::{record, PROCESSING_DURATION, RETRY_STORE_SIZE};
use crate::retry::{RetryStore, WorkItem};
use crate::shutdown::Stoppable;
use crate::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError};
use async_trait::async_trait;
use message_bus::{BrokerClient, ConsumerHandle, Delivery, DeliveryHandler};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Business logic plugged into an [`IdempotentConsumer`]
#[async_trait]
pub trait EventProcessor: Send + Sync + 'static {
    /// Wire event
    type Event: DeserializeOwned + Send + Sync + 'static;

    /// Natural key used for duplicate suppression and retry bookkeeping
    type Key: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static;

    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Natural key of `event`
    fn key(&self, event: &Self::Event) -> Self::Key;

    /// Events returning false are acked and ignored
    fn accepts(&self, _event: &Self::Event) -> bool {
        true
    }

    /// Whether the event behind `key` was already applied
    async fn is_processed(&self, key: &Self::Key) -> bool;

    /// Apply one event; errors send it to the retry store
    async fn process(&self, event: &Self::Event) -> Result<Outcome>;

    /// Period of [`EventProcessor::maintain`], if any
    fn maintenance_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic housekeeping such as TTL sweeps
    async fn maintain(&self) {}
}

/// What [`EventProcessor::process`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed
    Applied,
    /// Acked without effect: another delivery owns or already applied it
    Skipped,
}

/// What to do when the work queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Park the event in the retry store
    Retry,
    /// Drop the event; a later one covers the same ground
    Skip,
}

/// Outcome of offering an event to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued for processing
    Enqueued,
    /// Already applied
    Duplicate,
    /// Not meant for this consumer
    Ignored,
    /// Queue full; parked in the retry store
    Deferred,
    /// Queue full and not retried, or retry store full
    Dropped,
    /// Consumer is shutting down
    Closed,
}

impl Offer {
    /// Whether the broker message should be acked
    pub fn settles(&self) -> bool {
        !matches!(self, Offer::Closed)
    }
}

struct Shared<P: EventProcessor> {
    processor: Arc<P>,
    config: PoolConfig,
    overflow: OverflowPolicy,
    sender: Sender<WorkItem<P::Event>>,
    retry: RetryStore<P::Key, P::Event>,
}

impl<P: EventProcessor> Shared<P> {
    fn name(&self) -> &'static str {
        self.processor.name()
    }

    async fn offer(&self, event: P::Event) -> Offer {
        let name = self.name();
        record(name, "received");

        if !self.processor.accepts(&event) {
            record(name, "ignored");
            return Offer::Ignored;
        }

        let key = self.processor.key(&event);
        if self.processor.is_processed(&key).await {
            debug!("{}: {} already processed, skipping", name, key);
            record(name, "duplicate");
            return Offer::Duplicate;
        }

        match self.sender.try_send(WorkItem::new(event)) {
            Ok(()) => {
                record(name, "enqueued");
                Offer::Enqueued
            }
            Err(TrySendError::Full(item)) => {
                record(name, "overflowed");
                match self.overflow {
                    OverflowPolicy::Retry => {
                        warn!("{}: work queue full, parking {} for retry", name, key);
                        if self.defer(key, item) {
                            Offer::Deferred
                        } else {
                            Offer::Dropped
                        }
                    }
                    OverflowPolicy::Skip => {
                        warn!("{}: work queue full, skipping {}", name, key);
                        record(name, "skipped");
                        Offer::Dropped
                    }
                }
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    fn defer(&self, key: P::Key, item: WorkItem<P::Event>) -> bool {
        let name = self.name();
        let result = self.retry.insert(key.clone(), item.deferred());
        self.update_retry_gauge();
        match result {
            Ok(()) => {
                record(name, "deferred");
                true
            }
            Err(_) => {
                warn!(
                    "⚠️ {}: retry store full ({} items), dropping {}",
                    name,
                    self.retry.capacity(),
                    key
                );
                record(name, "dropped");
                false
            }
        }
    }

    async fn process_item(&self, item: WorkItem<P::Event>) {
        let name = self.name();
        let key = self.processor.key(&item.event);

        if self.processor.is_processed(&key).await {
            debug!("{}: {} processed meanwhile, skipping", name, key);
            record(name, "duplicate");
            return;
        }

        let start = Instant::now();
        let deadline = self.config.processing_timeout();
        let result = match tokio::time::timeout(deadline, self.processor.process(&item.event)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.processing_timeout_ms)),
        };
        PROCESSING_DURATION
            .with_label_values(&[name])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(Outcome::Applied) => record(name, "processed"),
            Ok(Outcome::Skipped) => {
                debug!("{}: {} acked without effect", name, key);
                record(name, "noop");
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "{}: processing {} failed (attempt {}): {}",
                    name,
                    key,
                    item.attempts + 1,
                    e
                );
                record(name, "failed");
                self.defer(key, item);
            }
            Err(e) => {
                error!("❌ {}: dropping {} after permanent failure: {}", name, key, e);
                record(name, "failed");
                record(name, "dropped");
            }
        }
    }

    fn drain_retries(&self) {
        let parked = self.retry.take_all();
        if parked.is_empty() {
            return;
        }

        let name = self.name();
        let max_attempts = self.config.max_retry_attempts;
        debug!("{}: re-enqueueing {} parked events", name, parked.len());

        for (key, item) in parked {
            if item.attempts > max_attempts {
                error!(
                    "❌ {}: giving up on {} after {} retries",
                    name, key, max_attempts
                );
                record(name, "dropped");
                continue;
            }

            match self.sender.try_send(item) {
                Ok(()) => record(name, "retried"),
                Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                    if self.retry.insert(key.clone(), item).is_err() {
                        warn!("⚠️ {}: retry store full, dropping {}", name, key);
                        record(name, "dropped");
                    }
                }
            }
        }

        self.update_retry_gauge();
    }

    fn update_retry_gauge(&self) {
        RETRY_STORE_SIZE
            .with_label_values(&[self.name()])
            .set(self.retry.len() as i64);
    }
}

#[async_trait]
impl<P: EventProcessor> DeliveryHandler for Shared<P> {
    async fn handle(&self, delivery: Delivery) {
        let name = self.name();
        let event = match delivery.decode::<P::Event>() {
            Ok(event) => event,
            Err(e) => {
                warn!("{}: discarding malformed message: {}", name, e);
                record(name, "malformed");
                if let Err(e) = delivery.nack(false).await {
                    warn!("{}: failed to reject malformed message: {}", name, e);
                }
                return;
            }
        };

        let settled = if self.offer(event).await.settles() {
            delivery.ack().await
        } else {
            delivery.nack(true).await
        };
        if let Err(e) = settled {
            warn!(
                "{}: failed to settle delivery {}: {}",
                name, delivery.delivery_tag, e
            );
        }
    }
}

/// Worker pool, retry store and broker subscription for one processor
pub struct IdempotentConsumer<P: EventProcessor> {
    shared: Arc<Shared<P>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    deliveries: Mutex<Option<ConsumerHandle>>,
}

impl<P: EventProcessor> IdempotentConsumer<P> {
    /// Spawn processing workers, the retry scavenger and maintenance
    pub fn start(processor: Arc<P>, config: PoolConfig, overflow: OverflowPolicy) -> Self {
        let (sender, receiver) = async_channel::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            processor,
            retry: RetryStore::new(config.retry_capacity),
            config,
            overflow,
            sender,
        });
        let token = CancellationToken::new();

        let workers = shared.config.processing_workers.max(1);
        let mut tasks = Vec::with_capacity(workers + 2);
        for worker in 0..workers {
            tasks.push(tokio::spawn(run_processor(
                shared.clone(),
                receiver.clone(),
                worker,
            )));
        }
        tasks.push(tokio::spawn(run_scavenger(shared.clone(), token.clone())));
        if let Some(period) = shared.processor.maintenance_interval() {
            tasks.push(tokio::spawn(run_maintenance(
                shared.clone(),
                period,
                token.clone(),
            )));
        }

        info!(
            "{}: started {} processing workers (queue {}, retry store {})",
            shared.name(),
            workers,
            shared.config.queue_capacity,
            shared.config.retry_capacity
        );

        Self {
            shared,
            token,
            tasks: Mutex::new(tasks),
            deliveries: Mutex::new(None),
        }
    }

    /// Subscribe `delivery_workers` handlers to `queue`
    pub async fn consume_from(&self, client: &BrokerClient, queue: &str) -> Result<()> {
        let handler: Arc<dyn DeliveryHandler> = self.shared.clone();
        let handle = client
            .consume(queue, self.shared.config.delivery_workers, handler)
            .await?;
        let previous = self.deliveries.lock().replace(handle);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    /// Run an already decoded event through duplicate check and enqueue
    pub async fn offer(&self, event: P::Event) -> Offer {
        self.shared.offer(event).await
    }

    /// Business logic
    pub fn processor(&self) -> &Arc<P> {
        &self.shared.processor
    }

    /// Events waiting in the work queue
    pub fn queue_len(&self) -> usize {
        self.shared.sender.len()
    }

    /// Events parked in the retry store
    pub fn retry_len(&self) -> usize {
        self.shared.retry.len()
    }

    /// Deferral count for a parked event
    pub fn retry_attempts(&self, key: &P::Key) -> Option<u32> {
        self.shared.retry.attempts(key)
    }
}

#[async_trait]
impl<P: EventProcessor> Stoppable for IdempotentConsumer<P> {
    fn name(&self) -> &str {
        self.shared.name()
    }

    async fn stop(&self) {
        let name = self.shared.name();
        info!("{}: stopping", name);

        let deliveries = self.deliveries.lock().take();
        if let Some(deliveries) = deliveries {
            deliveries.stop().await;
        }

        self.token.cancel();
        self.shared.sender.close();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("{}: worker ended abnormally: {}", name, e);
            }
        }

        let parked = self.shared.retry.len();
        if parked > 0 {
            warn!("⚠️ {}: {} events left in the retry store", name, parked);
        }
    }
}

async fn run_processor<P: EventProcessor>(
    shared: Arc<Shared<P>>,
    receiver: Receiver<WorkItem<P::Event>>,
    worker: usize,
) {
    debug!("{}: processing worker {} started", shared.name(), worker);
    while let Ok(item) = receiver.recv().await {
        shared.process_item(item).await;
    }
    debug!("{}: processing worker {} exited", shared.name(), worker);
}

async fn run_scavenger<P: EventProcessor>(shared: Arc<Shared<P>>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.retry_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => shared.drain_retries(),
        }
    }
}

async fn run_maintenance<P: EventProcessor>(
    shared: Arc<Shared<P>>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => shared.processor.maintain().await,
        }
    }
}
