//! Broker transport seam
//!
//! A [`Transport`] dials [`Connection`]s; a connection opens lightweight
//! [`Session`]s (AMQP channels, JetStream contexts) on which topology is
//! declared, messages are published and queues are consumed.

use crate::message::Delivery;
use crate::types::{BindDef, ExchangeDef, QueueDef};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of deliveries from one queue subscription.
///
/// The stream ends when the session or its connection closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Dials broker connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection
    async fn connect(&self) -> Result<Arc<dyn Connection>>;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}

/// A live broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a session on this connection
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Whether the connection has been lost or closed
    fn is_closed(&self) -> bool;

    /// Resolves once the connection is lost or closed
    async fn closed(&self);

    /// Close the connection
    async fn close(&self);
}

/// A session (channel) multiplexed over a connection
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the session can still be used
    fn is_open(&self) -> bool;

    /// Declare an exchange
    async fn declare_exchange(&self, def: &ExchangeDef) -> Result<()>;

    /// Declare a queue
    async fn declare_queue(&self, def: &QueueDef) -> Result<()>;

    /// Bind a queue to an exchange
    async fn bind(&self, def: &BindDef) -> Result<()>;

    /// Publish a JSON payload
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a queue with manual acknowledgment
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Close the session
    async fn close(&self);
}
