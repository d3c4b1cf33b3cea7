//! Settlement Pipeline
//!
//! Turns "a block was mined" into miner payouts, persisted ledger rows,
//! live market updates and periodic balance reconciliation, over a message
//! broker that delivers at least once.
//!
//! # Architecture
//!
//! Every queue is drained by an [`IdempotentConsumer`] wrapping one
//! [`EventProcessor`]:
//!
//! 1. **Reward calculation**: block reward basis → bonus and breakdown →
//!    distribution event
//! 2. **Reward distribution**: transactional wallet credit plus history row,
//!    at most once per `(block number, miner)` within the idempotency TTL
//! 3. **Market pricing / volume**: price deltas, alerts, volume statistics
//!    and window aggregation, broadcast to live subscribers
//! 4. **Ledger persistence / audit**: bulk insert of ledger batches and a
//!    bounded audit trail
//! 5. **Reconciliation**: every Nth block, ledger-derived balances are
//!    compared with wallets and mismatches recorded
//!
//! # Example
//!
//! ```no_run
//! use settlement::{ChannelSink, Config, SettlementNode, Stores};
//! use message_bus::MemoryBroker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let node = SettlementNode::start(
//!         Config::default(),
//!         Arc::new(MemoryBroker::new()),
//!         Stores::in_memory(),
//!         Arc::new(ChannelSink::new(64)),
//!     )
//!     .await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod broadcast;
pub mod config;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod ledger_audit;
pub mod ledger_persistence;
pub mod market_pricing;
pub mod market_volume;
pub mod metrics;
pub mod node;
pub mod reconciliation;
pub mod retry;
pub mod reward_calculation;
pub mod reward_distribution;
pub mod shutdown;
pub mod topology;

// Re-exports
pub use broadcast::{BroadcastMessage, BroadcastSink, ChannelSink, RecordingSink};
pub use config::{Config, PoolConfig};
pub use consumer::{EventProcessor, IdempotentConsumer, Offer, Outcome, OverflowPolicy};
pub use error::{Error, Result};
pub use idempotency::{IdempotencyStore, ProcessedSet, TtlIdempotencyStore};
pub use ledger_audit::{AuditAction, AuditRecord, LedgerAuditor};
pub use ledger_persistence::LedgerPersister;
pub use market_pricing::{AlertLevel, PriceChange, PricingMonitor};
pub use market_volume::{VolumeAggregate, VolumeStats, VolumeTracker};
pub use node::{transport_for, SettlementNode, Stores};
pub use reconciliation::{ManualReview, ReconcileReport, Reconciler};
pub use reward_calculation::{CalculationMetrics, RewardCalculator};
pub use reward_distribution::{RewardDistributor, RewardStats};
pub use shutdown::{shutdown_all, Stoppable};
