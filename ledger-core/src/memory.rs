//! In-memory repository implementations
//!
//! Used by tests and by single-process runs. Every store can be told to
//! fail specific operations a number of times through [`Faults`], which is
//! how transient storage failures are simulated.

use crate::storage::{DiscrepancyStore, LedgerStore, MarketTickStore, WalletStore, WalletTx};
use crate::types::{Address, BalanceDiscrepancy, LedgerEntry, MarketTick, Wallet, WalletHistory};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `WalletStore::begin_tx`
    BeginTx,
    /// `WalletTx::get_for_update`
    GetForUpdate,
    /// `WalletTx::upsert_empty`
    UpsertEmpty,
    /// `WalletTx::update_balance`
    UpdateBalance,
    /// `WalletTx::insert_history`
    InsertHistory,
    /// `WalletTx::commit`
    Commit,
    /// `WalletStore::get_multiple`
    GetMultiple,
    /// `LedgerStore::bulk_create`
    BulkCreate,
    /// `LedgerStore::entries_by_block_id`
    EntriesByBlock,
    /// `DiscrepancyStore::store`
    StoreDiscrepancy,
    /// `MarketTickStore::tick_by_block_id`
    TickByBlock,
    /// `MarketTickStore::volume_history` and `volume_block_range`
    VolumeQuery,
}

/// Armed failures per operation
#[derive(Debug, Default)]
pub struct Faults(Mutex<HashMap<FaultPoint, u32>>);

impl Faults {
    /// Fail the next `times` calls of `point`
    pub fn arm(&self, point: FaultPoint, times: u32) {
        *self.0.lock().entry(point).or_insert(0) += times;
    }

    /// Clear all armed failures
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn trip(&self, point: FaultPoint) -> Result<()> {
        let mut armed = self.0.lock();
        match armed.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Storage(format!("injected failure at {:?}", point)))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct WalletState {
    wallets: RwLock<HashMap<Address, Wallet>>,
    history: RwLock<Vec<WalletHistory>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    faults: Faults,
}

/// Wallet store; transactions are serialized by a store-wide lock
#[derive(Debug, Clone, Default)]
pub struct MemoryWalletStore {
    state: Arc<WalletState>,
}

impl MemoryWalletStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a wallet outside any transaction
    pub fn insert(&self, wallet: Wallet) {
        self.state
            .wallets
            .write()
            .insert(wallet.address.clone(), wallet);
    }

    /// Committed wallet
    pub fn wallet(&self, address: &Address) -> Option<Wallet> {
        self.state.wallets.read().get(address).cloned()
    }

    /// Committed history rows for an address
    pub fn history(&self, address: &Address) -> Vec<WalletHistory> {
        self.state
            .history
            .read()
            .iter()
            .filter(|h| &h.address == address)
            .cloned()
            .collect()
    }

    /// Total committed history rows
    pub fn history_len(&self) -> usize {
        self.state.history.read().len()
    }

    /// Fault injection
    pub fn faults(&self) -> &Faults {
        &self.state.faults
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn begin_tx(&self) -> Result<Box<dyn WalletTx>> {
        self.state.faults.trip(FaultPoint::BeginTx)?;
        let guard = self.state.write_lock.clone().lock_owned().await;
        Ok(Box::new(MemoryWalletTx {
            state: self.state.clone(),
            _guard: guard,
            staged: HashMap::new(),
            history: Vec::new(),
        }))
    }

    async fn get_multiple(&self, addresses: &[Address]) -> Result<Vec<Wallet>> {
        self.state.faults.trip(FaultPoint::GetMultiple)?;
        let wallets = self.state.wallets.read();
        Ok(addresses
            .iter()
            .filter_map(|a| wallets.get(a).cloned())
            .collect())
    }
}

struct MemoryWalletTx {
    state: Arc<WalletState>,
    _guard: OwnedMutexGuard<()>,
    staged: HashMap<Address, Wallet>,
    history: Vec<WalletHistory>,
}

impl MemoryWalletTx {
    fn current(&self, address: &Address) -> Option<Wallet> {
        self.staged
            .get(address)
            .cloned()
            .or_else(|| self.state.wallets.read().get(address).cloned())
    }
}

#[async_trait]
impl WalletTx for MemoryWalletTx {
    async fn get_for_update(&mut self, address: &Address) -> Result<Option<Wallet>> {
        self.state.faults.trip(FaultPoint::GetForUpdate)?;
        Ok(self.current(address))
    }

    async fn upsert_empty(&mut self, address: &Address) -> Result<Wallet> {
        self.state.faults.trip(FaultPoint::UpsertEmpty)?;
        if let Some(existing) = self.current(address) {
            return Ok(existing);
        }
        let wallet = Wallet::empty(address.clone());
        self.staged.insert(address.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn update_balance(&mut self, address: &Address, new_balance: Decimal) -> Result<()> {
        self.state.faults.trip(FaultPoint::UpdateBalance)?;
        if new_balance < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "negative balance {} for {}",
                new_balance, address
            )));
        }
        let mut wallet = self
            .current(address)
            .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;

        let delta = new_balance - wallet.balance;
        if delta > Decimal::ZERO {
            wallet.total_received += delta;
        } else {
            wallet.total_sent -= delta;
        }
        wallet.balance = new_balance;
        wallet.updated_at = Utc::now();
        self.staged.insert(address.clone(), wallet);
        Ok(())
    }

    async fn insert_history(&mut self, entry: WalletHistory) -> Result<()> {
        self.state.faults.trip(FaultPoint::InsertHistory)?;
        self.history.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.state.faults.trip(FaultPoint::Commit)?;
        let MemoryWalletTx {
            state,
            _guard,
            staged,
            history,
        } = *self;
        {
            let mut wallets = state.wallets.write();
            let mut rows = state.history.write();
            wallets.extend(staged);
            rows.extend(history);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Ledger store
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
    faults: Arc<Faults>,
}

impl MemoryLedgerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored entry
    pub fn all(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No entries stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fault injection
    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn bulk_create(&self, entries: &[LedgerEntry]) -> Result<usize> {
        self.faults.trip(FaultPoint::BulkCreate)?;
        self.entries.write().extend_from_slice(entries);
        Ok(entries.len())
    }

    async fn entries_by_block_id(&self, block_id: i64) -> Result<Vec<LedgerEntry>> {
        self.faults.trip(FaultPoint::EntriesByBlock)?;
        let mut found: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.block_id == block_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }
}

/// Discrepancy store
#[derive(Debug, Clone)]
pub struct MemoryDiscrepancyStore {
    rows: Arc<RwLock<BTreeMap<i64, BalanceDiscrepancy>>>,
    next_id: Arc<AtomicI64>,
    faults: Arc<Faults>,
}

impl Default for MemoryDiscrepancyStore {
    fn default() -> Self {
        Self {
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            faults: Arc::new(Faults::default()),
        }
    }
}

impl MemoryDiscrepancyStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection
    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl DiscrepancyStore for MemoryDiscrepancyStore {
    async fn store(&self, discrepancy: &BalanceDiscrepancy) -> Result<i64> {
        self.faults.trip(FaultPoint::StoreDiscrepancy)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = discrepancy.clone();
        row.id = id;
        self.rows.write().insert(id, row);
        Ok(id)
    }

    async fn unresolved(&self, limit: usize) -> Result<Vec<BalanceDiscrepancy>> {
        let mut open: Vec<_> = self
            .rows
            .read()
            .values()
            .filter(|d| !d.resolved)
            .cloned()
            .collect();
        open.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        open.truncate(limit);
        Ok(open)
    }

    async fn by_address(&self, address: &Address) -> Result<Vec<BalanceDiscrepancy>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|d| &d.address == address)
            .cloned()
            .collect())
    }

    async fn by_block_number(&self, block_number: i64) -> Result<Vec<BalanceDiscrepancy>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|d| d.block_number == block_number)
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, id: i64, note: &str) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(Error::DiscrepancyNotFound(id))?;
        row.resolved = true;
        row.resolution_note = Some(note.to_string());
        row.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().len())
    }
}

/// Market tick store keyed by block ID
#[derive(Debug, Clone, Default)]
pub struct MemoryMarketTickStore {
    ticks: Arc<RwLock<BTreeMap<i64, MarketTick>>>,
    faults: Arc<Faults>,
}

impl MemoryMarketTickStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick (replaces any tick for the same block)
    pub fn insert(&self, tick: MarketTick) {
        self.ticks.write().insert(tick.block_id, tick);
    }

    /// Fault injection
    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl MarketTickStore for MemoryMarketTickStore {
    async fn tick_by_block_id(&self, block_id: i64) -> Result<Option<MarketTick>> {
        self.faults.trip(FaultPoint::TickByBlock)?;
        Ok(self.ticks.read().get(&block_id).cloned())
    }

    async fn volume_history(&self, limit: usize, offset: usize) -> Result<Vec<MarketTick>> {
        self.faults.trip(FaultPoint::VolumeQuery)?;
        Ok(self
            .ticks
            .read()
            .values()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn volume_block_range(&self, start: i64, end: i64) -> Result<Vec<MarketTick>> {
        self.faults.trip(FaultPoint::VolumeQuery)?;
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .ticks
            .read()
            .range(start..=end)
            .map(|(_, t)| t.clone())
            .collect())
    }
}
