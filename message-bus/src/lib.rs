//! Message bus with durable queues and manual acknowledgment
//!
//! Provides exchange/queue messaging with:
//! - A pooled set of sessions over one broker connection
//! - Automatic reconnect with exponential backoff and topology replay
//! - Multi-worker queue consumers with explicit ack/nack per delivery
//! - An in-process broker and a NATS JetStream transport
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod pool;
pub mod publisher;
pub mod subscriber;
pub mod topology;
pub mod transport;
pub mod types;

pub use client::{BrokerClient, ClientConfig};
pub use error::{Error, Result};
pub use memory::MemoryBroker;
pub use message::{Acker, Delivery};
pub use nats::{NatsConfig, NatsTransport};
pub use pool::SessionPool;
pub use publisher::{Publisher, PublisherConfig};
pub use subscriber::{ConsumerHandle, DeliveryHandler};
pub use topology::Topology;
pub use transport::{Connection, DeliveryStream, Session, Transport};
pub use types::{BindDef, ExchangeDef, ExchangeKind, QueueDef};
