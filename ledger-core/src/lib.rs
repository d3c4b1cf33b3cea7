//! Ledger Core
//!
//! Domain model and persistence ports for the settlement pipeline.
//!
//! # Architecture
//!
//! - **Types**: wallets, wallet history, ledger entries, discrepancies, ticks
//! - **Events**: JSON wire events exchanged over the message bus
//! - **Ports**: async repository traits with transactional wallet updates
//! - **Memory**: in-process implementations of every port
//!
//! # Invariants
//!
//! - A wallet balance change and its history row commit together or not at all
//! - Ledger entries are append-only
//! - Amounts are exact decimals

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod emission;
pub mod error;
pub mod events;
pub mod memory;
pub mod storage;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use events::{
    LedgerBatchEvent, LedgerEntryEvent, MarketPricingEvent, MarketVolumeUpdate, PriceUpdate,
    RewardBreakdown, RewardCalculationEvent, RewardDistributionEvent,
};
pub use memory::{
    FaultPoint, Faults, MemoryDiscrepancyStore, MemoryLedgerStore, MemoryMarketTickStore,
    MemoryWalletStore,
};
pub use storage::{DiscrepancyStore, LedgerStore, MarketTickStore, WalletStore, WalletTx};
pub use types::{
    Address, BalanceDiscrepancy, ChangeType, LedgerEntry, MarketState, MarketTick, Wallet,
    WalletHistory,
};
