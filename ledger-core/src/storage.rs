//! Repository ports
//!
//! The settlement pipeline talks to persistence only through these traits.
//! A relational backend implements them with real transactions and row
//! locks; [`crate::memory`] provides in-process implementations.

use crate::types::{Address, BalanceDiscrepancy, LedgerEntry, MarketTick, Wallet, WalletHistory};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Wallet persistence
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Open a transaction
    async fn begin_tx(&self) -> Result<Box<dyn WalletTx>>;

    /// Read wallets without locking; unknown addresses are omitted
    async fn get_multiple(&self, addresses: &[Address]) -> Result<Vec<Wallet>>;
}

/// Open wallet transaction.
///
/// Dropping a transaction without calling [`WalletTx::commit`] discards
/// every change made through it.
#[async_trait]
pub trait WalletTx: Send {
    /// Read and lock a wallet row for the rest of the transaction
    async fn get_for_update(&mut self, address: &Address) -> Result<Option<Wallet>>;

    /// Create a zero-balance wallet if none exists, returning the row
    async fn upsert_empty(&mut self, address: &Address) -> Result<Wallet>;

    /// Set the balance of an existing wallet
    async fn update_balance(&mut self, address: &Address, new_balance: Decimal) -> Result<()>;

    /// Append an audit row
    async fn insert_history(&mut self, entry: WalletHistory) -> Result<()>;

    /// Make all changes visible atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all changes
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Append-only ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert entries, returning how many were written
    async fn bulk_create(&self, entries: &[LedgerEntry]) -> Result<usize>;

    /// Entries belonging to a block, in ID order
    async fn entries_by_block_id(&self, block_id: i64) -> Result<Vec<LedgerEntry>>;
}

/// Recorded balance discrepancies
#[async_trait]
pub trait DiscrepancyStore: Send + Sync {
    /// Persist, returning the assigned ID
    async fn store(&self, discrepancy: &BalanceDiscrepancy) -> Result<i64>;

    /// Most recent unresolved discrepancies
    async fn unresolved(&self, limit: usize) -> Result<Vec<BalanceDiscrepancy>>;

    /// Discrepancies for an address
    async fn by_address(&self, address: &Address) -> Result<Vec<BalanceDiscrepancy>>;

    /// Discrepancies found at a checkpoint block
    async fn by_block_number(&self, block_number: i64) -> Result<Vec<BalanceDiscrepancy>>;

    /// Mark resolved with a note
    async fn mark_resolved(&self, id: i64, note: &str) -> Result<()>;

    /// Total stored
    async fn count(&self) -> Result<usize>;
}

/// Persisted market ticks
#[async_trait]
pub trait MarketTickStore: Send + Sync {
    /// Tick for a block, if recorded
    async fn tick_by_block_id(&self, block_id: i64) -> Result<Option<MarketTick>>;

    /// Newest ticks first
    async fn volume_history(&self, limit: usize, offset: usize) -> Result<Vec<MarketTick>>;

    /// Ticks with `start <= block_id <= end`, oldest first
    async fn volume_block_range(&self, start: i64, end: i64) -> Result<Vec<MarketTick>>;
}
