//! Ledger persistence consumer
//!
//! Writes the entries of each ledger batch with one bulk insert. A block ID
//! is only written once; a failed insert goes to the retry store.

use crate::consumer::{EventProcessor, Outcome};
use crate::idempotency::ProcessedSet;
use crate::Result;
use async_trait::async_trait;
use ledger_core::{LedgerBatchEvent, LedgerEntry, LedgerStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Block IDs remembered for duplicate suppression
pub const PROCESSED_CAPACITY: usize = 100_000;

/// Persistence processor
pub struct LedgerPersister {
    ledger: Arc<dyn LedgerStore>,
    processed: ProcessedSet<i64>,
}

impl LedgerPersister {
    /// Create persister
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            processed: ProcessedSet::new(PROCESSED_CAPACITY),
        }
    }

    /// Write one batch, returning the rows inserted
    pub async fn persist(&self, batch: &LedgerBatchEvent) -> Result<usize> {
        if batch.entries.is_empty() {
            info!("No entries to persist for block #{}", batch.block_number);
            self.processed.insert(batch.block_id);
            return Ok(0);
        }

        let entries: Vec<LedgerEntry> = batch
            .entries
            .iter()
            .map(|e| {
                let mut entry = e.to_entry();
                entry.block_id = batch.block_id;
                entry
            })
            .collect();

        debug!(
            "Persisting {} ledger entries for block #{}",
            entries.len(),
            batch.block_number
        );
        let inserted = self.ledger.bulk_create(&entries).await?;
        self.processed.insert(batch.block_id);

        info!(
            "Inserted {} ledger entries for block #{} (ID {})",
            inserted, batch.block_number, batch.block_id
        );
        Ok(inserted)
    }
}

#[async_trait]
impl EventProcessor for LedgerPersister {
    type Event = LedgerBatchEvent;
    type Key = i64;

    fn name(&self) -> &'static str {
        "ledger_persistence"
    }

    fn key(&self, batch: &LedgerBatchEvent) -> i64 {
        batch.block_id
    }

    async fn is_processed(&self, key: &i64) -> bool {
        self.processed.contains(key)
    }

    async fn process(&self, batch: &LedgerBatchEvent) -> Result<Outcome> {
        self.persist(batch).await.map(|_| Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{FaultPoint, LedgerEntryEvent, MemoryLedgerStore};
    use rust_decimal_macros::dec;

    fn batch(block_id: i64, count: i64) -> LedgerBatchEvent {
        let entries = (1..=count)
            .map(|i| LedgerEntryEvent {
                entry_id: block_id * 100 + i,
                tx_id: Some(i),
                block_id,
                block_number: block_id,
                address: format!("addr-{}", i).as_str().into(),
                amount: dec!(1),
                balance_after: dec!(1),
                entry_type: "TRANSFER".to_string(),
                timestamp: 1_700_000_000,
            })
            .collect::<Vec<_>>();
        LedgerBatchEvent {
            block_id,
            block_number: block_id,
            total_entries: entries.len(),
            entries,
            timestamp: 1_700_000_000,
            miner_address: "M".into(),
        }
    }

    #[tokio::test]
    async fn test_batch_written_once() {
        let ledger = MemoryLedgerStore::new();
        let persister = LedgerPersister::new(Arc::new(ledger.clone()));

        assert_eq!(persister.persist(&batch(3, 4)).await.unwrap(), 4);
        assert!(persister.is_processed(&3).await);
        assert_eq!(ledger.len(), 4);
        assert!(ledger.all().iter().all(|e| e.block_id == 3));
    }

    #[tokio::test]
    async fn test_failed_insert_is_retryable_and_not_marked() {
        let ledger = MemoryLedgerStore::new();
        ledger.faults().arm(FaultPoint::BulkCreate, 1);
        let persister = LedgerPersister::new(Arc::new(ledger.clone()));

        let err = persister.persist(&batch(4, 2)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!persister.is_processed(&4).await);

        persister.persist(&batch(4, 2)).await.unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let ledger = MemoryLedgerStore::new();
        let persister = LedgerPersister::new(Arc::new(ledger.clone()));

        assert_eq!(persister.persist(&batch(5, 0)).await.unwrap(), 0);
        assert!(ledger.is_empty());
    }
}
