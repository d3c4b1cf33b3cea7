//! Ledger reconciliation engine
//!
//! Every ledger batch whose block number is a multiple of the checkpoint
//! interval is reconciled: the last `balance_after` per address in the
//! block's ledger entries is compared with the live wallet balance.
//!
//! Two kinds of discrepancy are recorded:
//!
//! - an address has ledger entries but no wallet row (expected vs zero)
//! - a wallet balance differs from the ledger by more than [`TOLERANCE`]
//!
//! If the ledger query fails, the entries carried in the batch are used
//! instead and the block is flagged for manual review. Reconciliation never
//! touches wallets; resolution is an explicit [`Reconciler::mark_resolved`].

use crate::config::ReconciliationConfig;
use crate::consumer::{EventProcessor, Outcome};
use crate::metrics::DISCREPANCIES_TOTAL;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{
    Address, BalanceDiscrepancy, DiscrepancyStore, LedgerBatchEvent, LedgerEntry, LedgerStore,
    WalletStore,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Largest balance difference treated as equal
pub const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

/// Reason recorded when the ledger could not be queried
pub const REASON_LEDGER_QUERY_FAILED: &str = "LEDGER_QUERY_FAILED";

/// Block flagged for a human to look at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualReview {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Why it was flagged
    pub reason: String,
    /// Flagged at
    pub flagged_at: DateTime<Utc>,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Checkpoint block number
    pub block_number: i64,
    /// Distinct addresses in the batch
    pub addresses_checked: usize,
    /// Mismatches detected, including ones already recorded
    pub discrepancies_found: usize,
    /// Mismatches newly recorded
    pub discrepancies_recorded: usize,
    /// Batch entries stood in for the ledger
    pub used_batch_fallback: bool,
}

/// Expected balance of one address according to the ledger
#[derive(Debug, Clone, Copy)]
struct Expected {
    balance: Decimal,
    last_entry_id: i64,
}

/// Last `balance_after` per address, taken from the highest entry ID
fn expected_balances(entries: &[LedgerEntry]) -> BTreeMap<Address, Expected> {
    let mut expected: BTreeMap<Address, Expected> = BTreeMap::new();
    for entry in entries {
        let candidate = Expected {
            balance: entry.balance_after,
            last_entry_id: entry.id,
        };
        expected
            .entry(entry.address.clone())
            .and_modify(|current| {
                if entry.id >= current.last_entry_id {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }
    expected
}

/// Compare expected balances against wallets, returning unrecorded mismatches
pub fn detect_discrepancies(
    block_number: i64,
    addresses: &BTreeSet<Address>,
    entries: &[LedgerEntry],
    wallets: &HashMap<Address, Decimal>,
) -> Vec<BalanceDiscrepancy> {
    let expected = expected_balances(entries);
    let mut found = Vec::new();

    for (address, ledger) in &expected {
        if !wallets.contains_key(address) {
            warn!("Missing wallet for ledger address {}", address);
            found.push(BalanceDiscrepancy::new(
                address.clone(),
                block_number,
                ledger.balance,
                Decimal::ZERO,
                Some(ledger.last_entry_id),
            ));
        }
    }

    for address in addresses {
        let Some(actual) = wallets.get(address) else {
            continue;
        };
        let (expected_balance, last_entry_id) = match expected.get(address) {
            Some(ledger) => (ledger.balance, Some(ledger.last_entry_id)),
            None => (Decimal::ZERO, None),
        };
        if (*actual - expected_balance).abs() > TOLERANCE {
            found.push(BalanceDiscrepancy::new(
                address.clone(),
                block_number,
                expected_balance,
                *actual,
                last_entry_id,
            ));
        }
    }

    found
}

/// Reconciliation processor
pub struct Reconciler {
    wallets: Arc<dyn WalletStore>,
    ledger: Arc<dyn LedgerStore>,
    store: Arc<dyn DiscrepancyStore>,
    config: ReconciliationConfig,
    discrepancies: RwLock<VecDeque<BalanceDiscrepancy>>,
    manual_review: RwLock<VecDeque<ManualReview>>,
    /// Held across the known check, the store write and the append
    record_lock: Mutex<()>,
}

impl Reconciler {
    /// Create reconciler
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        ledger: Arc<dyn LedgerStore>,
        store: Arc<dyn DiscrepancyStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            wallets,
            ledger,
            store,
            config,
            discrepancies: RwLock::new(VecDeque::new()),
            manual_review: RwLock::new(VecDeque::new()),
            record_lock: Mutex::new(()),
        }
    }

    /// Whether `block_number` is a checkpoint
    pub fn is_checkpoint(&self, block_number: i64) -> bool {
        self.config.checkpoint_interval > 0 && block_number % self.config.checkpoint_interval == 0
    }

    /// Reconcile one batch
    pub async fn reconcile(&self, batch: &LedgerBatchEvent) -> Result<ReconcileReport> {
        let addresses: BTreeSet<Address> =
            batch.entries.iter().map(|e| e.address.clone()).collect();
        let lookup: Vec<Address> = addresses.iter().cloned().collect();

        let wallets: HashMap<Address, Decimal> = self
            .wallets
            .get_multiple(&lookup)
            .await?
            .into_iter()
            .map(|w| (w.address, w.balance))
            .collect();

        let mut used_batch_fallback = false;
        let entries = match self.ledger.entries_by_block_id(batch.block_id).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "Ledger query for block #{} failed, falling back to {} batch entries: {}",
                    batch.block_number,
                    batch.entries.len(),
                    e
                );
                used_batch_fallback = true;
                self.flag_for_review(batch, REASON_LEDGER_QUERY_FAILED);
                batch.entries.iter().map(|e| e.to_entry()).collect()
            }
        };

        let found = detect_discrepancies(batch.block_number, &addresses, &entries, &wallets);
        let mut recorded = 0;
        for discrepancy in &found {
            if self.record(discrepancy).await? {
                recorded += 1;
            }
        }

        info!(
            "Reconciliation complete for block #{}: {} addresses, {} discrepancies ({} new)",
            batch.block_number,
            addresses.len(),
            found.len(),
            recorded
        );

        Ok(ReconcileReport {
            block_number: batch.block_number,
            addresses_checked: addresses.len(),
            discrepancies_found: found.len(),
            discrepancies_recorded: recorded,
            used_batch_fallback,
        })
    }

    /// Persist and remember a discrepancy unless the same observation is known
    async fn record(&self, discrepancy: &BalanceDiscrepancy) -> Result<bool> {
        let _guard = self.record_lock.lock().await;
        let known = self
            .discrepancies
            .read()
            .iter()
            .any(|d| d.same_observation(discrepancy));
        if known {
            debug!(
                "Discrepancy for {} at block #{} already recorded",
                discrepancy.address, discrepancy.block_number
            );
            return Ok(false);
        }

        let id = self.store.store(discrepancy).await?;
        let mut stored = discrepancy.clone();
        stored.id = id;

        {
            let mut list = self.discrepancies.write();
            if list.len() >= self.config.max_discrepancies.max(1) {
                list.pop_front();
                debug!("Evicted oldest discrepancy");
            }
            list.push_back(stored);
        }

        DISCREPANCIES_TOTAL.inc();
        warn!(
            "⚠️ DISCREPANCY {} at block #{}: ledger {}, wallet {}, diff {}",
            discrepancy.address,
            discrepancy.block_number,
            discrepancy.expected_balance,
            discrepancy.actual_balance,
            discrepancy.difference
        );
        Ok(true)
    }

    fn flag_for_review(&self, batch: &LedgerBatchEvent, reason: &str) {
        warn!(
            "Block #{} (ID {}) flagged for manual review: {}",
            batch.block_number, batch.block_id, reason
        );
        let mut list = self.manual_review.write();
        if list.len() >= self.config.max_manual_review.max(1) {
            list.pop_front();
        }
        list.push_back(ManualReview {
            block_id: batch.block_id,
            block_number: batch.block_number,
            reason: reason.to_string(),
            flagged_at: Utc::now(),
        });
    }

    /// In-memory discrepancies, oldest first
    pub fn discrepancies(&self) -> Vec<BalanceDiscrepancy> {
        self.discrepancies.read().iter().cloned().collect()
    }

    /// Blocks awaiting manual review, oldest first
    pub fn manual_reviews(&self) -> Vec<ManualReview> {
        self.manual_review.read().iter().cloned().collect()
    }

    /// Most recent unresolved discrepancies from the store
    pub async fn unresolved(&self, limit: usize) -> Result<Vec<BalanceDiscrepancy>> {
        Ok(self.store.unresolved(limit).await?)
    }

    /// Stored discrepancies for an address
    pub async fn by_address(&self, address: &Address) -> Result<Vec<BalanceDiscrepancy>> {
        Ok(self.store.by_address(address).await?)
    }

    /// Stored discrepancies for a checkpoint block
    pub async fn by_block(&self, block_number: i64) -> Result<Vec<BalanceDiscrepancy>> {
        Ok(self.store.by_block_number(block_number).await?)
    }

    /// Stored discrepancy count
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.count().await?)
    }

    /// Mark a discrepancy resolved out of band
    pub async fn mark_resolved(&self, id: i64, note: &str) -> Result<()> {
        self.store.mark_resolved(id, note).await?;
        if let Some(d) = self.discrepancies.write().iter_mut().find(|d| d.id == id) {
            d.resolved = true;
            d.resolution_note = Some(note.to_string());
            d.resolved_at = Some(Utc::now());
        }
        info!("Discrepancy {} resolved: {}", id, note);
        Ok(())
    }
}

#[async_trait]
impl EventProcessor for Reconciler {
    type Event = LedgerBatchEvent;
    type Key = i64;

    fn name(&self) -> &'static str {
        "ledger_reconcile"
    }

    fn key(&self, batch: &LedgerBatchEvent) -> i64 {
        batch.block_number
    }

    fn accepts(&self, batch: &LedgerBatchEvent) -> bool {
        self.is_checkpoint(batch.block_number)
    }

    async fn is_processed(&self, _key: &i64) -> bool {
        false
    }

    async fn process(&self, batch: &LedgerBatchEvent) -> Result<Outcome> {
        self.reconcile(batch).await.map(|_| Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{
        FaultPoint, LedgerEntryEvent, MemoryDiscrepancyStore, MemoryLedgerStore,
        MemoryWalletStore, Wallet,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        wallets: MemoryWalletStore,
        ledger: MemoryLedgerStore,
        store: MemoryDiscrepancyStore,
        reconciler: Reconciler,
    }

    fn fixture(config: ReconciliationConfig) -> Fixture {
        let wallets = MemoryWalletStore::new();
        let ledger = MemoryLedgerStore::new();
        let store = MemoryDiscrepancyStore::new();
        let reconciler = Reconciler::new(
            Arc::new(wallets.clone()),
            Arc::new(ledger.clone()),
            Arc::new(store.clone()),
            config,
        );
        Fixture {
            wallets,
            ledger,
            store,
            reconciler,
        }
    }

    fn entry(id: i64, address: &str, amount: Decimal, balance_after: Decimal) -> LedgerEntryEvent {
        LedgerEntryEvent {
            entry_id: id,
            tx_id: Some(id),
            block_id: 5,
            block_number: 50,
            address: address.into(),
            amount,
            balance_after,
            entry_type: "TRANSFER".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    fn batch(block_number: i64, entries: Vec<LedgerEntryEvent>) -> LedgerBatchEvent {
        LedgerBatchEvent {
            block_id: 5,
            block_number,
            total_entries: entries.len(),
            entries,
            timestamp: 1_700_000_000,
            miner_address: "M".into(),
        }
    }

    async fn persist(fixture: &Fixture, batch: &LedgerBatchEvent) {
        let entries: Vec<_> = batch.entries.iter().map(|e| e.to_entry()).collect();
        ledger_core::LedgerStore::bulk_create(&fixture.ledger, &entries)
            .await
            .unwrap();
    }

    fn wallet(fixture: &Fixture, address: &str, balance: Decimal) {
        let mut wallet = Wallet::empty(address.into());
        wallet.balance = balance;
        fixture.wallets.insert(wallet);
    }

    /// Delays every write so concurrent passes overlap
    struct SlowStore(MemoryDiscrepancyStore);

    #[async_trait]
    impl DiscrepancyStore for SlowStore {
        async fn store(&self, discrepancy: &BalanceDiscrepancy) -> ledger_core::Result<i64> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.store(discrepancy).await
        }

        async fn unresolved(&self, limit: usize) -> ledger_core::Result<Vec<BalanceDiscrepancy>> {
            self.0.unresolved(limit).await
        }

        async fn by_address(&self, address: &Address) -> ledger_core::Result<Vec<BalanceDiscrepancy>> {
            self.0.by_address(address).await
        }

        async fn by_block_number(
            &self,
            block_number: i64,
        ) -> ledger_core::Result<Vec<BalanceDiscrepancy>> {
            self.0.by_block_number(block_number).await
        }

        async fn mark_resolved(&self, id: i64, note: &str) -> ledger_core::Result<()> {
            self.0.mark_resolved(id, note).await
        }

        async fn count(&self) -> ledger_core::Result<usize> {
            self.0.count().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_passes_store_one_discrepancy() {
        let f = fixture(ReconciliationConfig::default());
        let reconciler = Reconciler::new(
            Arc::new(f.wallets.clone()),
            Arc::new(f.ledger.clone()),
            Arc::new(SlowStore(f.store.clone())),
            ReconciliationConfig::default(),
        );
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        persist(&f, &b).await;
        wallet(&f, "A", dec!(50.01));

        let (first, second) = tokio::join!(reconciler.reconcile(&b), reconciler.reconcile(&b));
        let recorded =
            first.unwrap().discrepancies_recorded + second.unwrap().discrepancies_recorded;

        assert_eq!(recorded, 1);
        assert_eq!(f.store.count().await.unwrap(), 1);
        assert_eq!(reconciler.discrepancies().len(), 1);
    }

    #[tokio::test]
    async fn test_difference_within_tolerance_is_ignored() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        persist(&f, &b).await;
        wallet(&f, "A", dec!(50.0000000005));

        let report = f.reconciler.reconcile(&b).await.unwrap();
        assert_eq!(report.discrepancies_found, 0);
        assert_eq!(f.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_records_actual_minus_expected() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        persist(&f, &b).await;
        wallet(&f, "A", dec!(50.01));

        let report = f.reconciler.reconcile(&b).await.unwrap();
        assert_eq!(report.discrepancies_recorded, 1);

        let stored = f.reconciler.by_address(&"A".into()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].difference, dec!(0.01));
        assert_eq!(stored[0].expected_balance, dec!(50));
        assert_eq!(stored[0].last_entry_id, Some(1));
    }

    #[tokio::test]
    async fn test_expected_balance_is_last_entry() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(
            50,
            vec![
                entry(2, "A", dec!(-5), dec!(45)),
                entry(1, "A", dec!(50), dec!(50)),
            ],
        );
        persist(&f, &b).await;
        wallet(&f, "A", dec!(45));

        let report = f.reconciler.reconcile(&b).await.unwrap();
        assert_eq!(report.discrepancies_found, 0);
    }

    #[tokio::test]
    async fn test_missing_wallet_is_expected_vs_zero() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "ghost", dec!(12), dec!(12))]);
        persist(&f, &b).await;

        f.reconciler.reconcile(&b).await.unwrap();
        let stored = f.reconciler.by_block(50).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].actual_balance, Decimal::ZERO);
        assert_eq!(stored[0].difference, dec!(-12));
    }

    #[tokio::test]
    async fn test_same_observation_stored_once() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        persist(&f, &b).await;
        wallet(&f, "A", dec!(40));

        f.reconciler.reconcile(&b).await.unwrap();
        let again = f.reconciler.reconcile(&b).await.unwrap();
        assert_eq!(again.discrepancies_found, 1);
        assert_eq!(again.discrepancies_recorded, 0);
        assert_eq!(f.reconciler.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_falls_back_and_flags() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(100, vec![entry(1, "A", dec!(50), dec!(50))]);
        wallet(&f, "A", dec!(49));
        f.ledger.faults().arm(FaultPoint::EntriesByBlock, 1);

        let report = f.reconciler.reconcile(&b).await.unwrap();
        assert!(report.used_batch_fallback);
        assert_eq!(report.discrepancies_recorded, 1);

        let reviews = f.reconciler.manual_reviews();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].block_number, 100);
        assert_eq!(reviews[0].reason, REASON_LEDGER_QUERY_FAILED);
    }

    #[tokio::test]
    async fn test_wallet_read_failure_is_retryable() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        f.wallets.faults().arm(FaultPoint::GetMultiple, 1);

        let err = f.reconciler.reconcile(&b).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_list_evicts_oldest() {
        let f = fixture(ReconciliationConfig {
            max_discrepancies: 2,
            ..Default::default()
        });
        for (i, address) in ["A", "B", "C"].iter().enumerate() {
            let b = batch(50, vec![entry(i as i64 + 1, address, dec!(1), dec!(1))]);
            wallet(&f, address, dec!(2));
            f.reconciler.reconcile(&b).await.unwrap();
        }

        let kept: Vec<String> = f
            .reconciler
            .discrepancies()
            .iter()
            .map(|d| d.address.to_string())
            .collect();
        assert_eq!(kept, vec!["B", "C"]);
        // The store keeps everything
        assert_eq!(f.store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mark_resolved() {
        let f = fixture(ReconciliationConfig::default());
        let b = batch(50, vec![entry(1, "A", dec!(50), dec!(50))]);
        persist(&f, &b).await;
        wallet(&f, "A", dec!(0));
        f.reconciler.reconcile(&b).await.unwrap();

        let id = f.reconciler.unresolved(10).await.unwrap()[0].id;
        f.reconciler.mark_resolved(id, "manual credit").await.unwrap();

        assert!(f.reconciler.unresolved(10).await.unwrap().is_empty());
        assert!(f.reconciler.discrepancies()[0].resolved);
        // Wallets are never touched
        assert_eq!(f.wallets.wallet(&"A".into()).unwrap().balance, dec!(0));
    }

    #[test]
    fn test_checkpoints() {
        let f = fixture(ReconciliationConfig::default());
        assert!(f.reconciler.is_checkpoint(50));
        assert!(f.reconciler.is_checkpoint(100));
        assert!(!f.reconciler.is_checkpoint(75));
        assert!(!f.reconciler.accepts(&batch(51, vec![])));
    }
}
