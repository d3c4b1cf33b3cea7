//! Ledger audit trail
//!
//! Records one audit row per ledger entry in a bounded in-memory trail and
//! flags unusually large movements.

use crate::config::LedgerAuditConfig;
use crate::consumer::{EventProcessor, Outcome};
use crate::idempotency::ProcessedSet;
use crate::Result;
use async_trait::async_trait;
use ledger_core::{Address, LedgerBatchEvent, LedgerEntryEvent};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Absolute amount above which an entry is reported
pub const LARGE_AMOUNT: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

/// Blocks between progress logs
const PROGRESS_INTERVAL: i64 = 100;

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Entry without a transaction
    Reward,
    /// Positive amount
    Credit,
    /// Zero or negative amount
    Debit,
}

impl AuditAction {
    /// Classify a ledger entry
    pub fn of(entry: &LedgerEntryEvent) -> Self {
        if entry.tx_id.is_none() {
            AuditAction::Reward
        } else if entry.amount > Decimal::ZERO {
            AuditAction::Credit
        } else {
            AuditAction::Debit
        }
    }
}

/// One audit row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Ledger entry ID
    pub entry_id: i64,
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Movement kind
    pub action: AuditAction,
    /// Account
    pub address: Address,
    /// Signed amount
    pub amount: Decimal,
    /// Entry timestamp (unix seconds)
    pub timestamp: i64,
    /// Matched by reconciliation
    pub reconciled: bool,
}

/// Audit processor
pub struct LedgerAuditor {
    config: LedgerAuditConfig,
    processed: ProcessedSet<i64>,
    trail: RwLock<VecDeque<AuditRecord>>,
}

impl LedgerAuditor {
    /// Create auditor
    pub fn new(config: LedgerAuditConfig) -> Self {
        Self {
            processed: ProcessedSet::new(config.max_records),
            config,
            trail: RwLock::new(VecDeque::new()),
        }
    }

    /// The newest `limit` records, oldest first
    pub fn audit_trail(&self, limit: usize) -> Vec<AuditRecord> {
        let trail = self.trail.read();
        let skip = trail.len().saturating_sub(limit);
        trail.iter().skip(skip).cloned().collect()
    }

    /// Records held
    pub fn len(&self) -> usize {
        self.trail.read().len()
    }

    /// Whether the trail is empty
    pub fn is_empty(&self) -> bool {
        self.trail.read().is_empty()
    }

    /// Append audit rows for a batch, returning how many were large
    pub fn audit(&self, batch: &LedgerBatchEvent) -> usize {
        let mut large = 0;
        let max = self.config.max_records.max(1);
        let mut trail = self.trail.write();

        for entry in &batch.entries {
            if entry.amount.abs() > LARGE_AMOUNT {
                large += 1;
                warn!(
                    "⚠️ Large transaction in block #{} for {}: {}",
                    batch.block_number, entry.address, entry.amount
                );
            }
            if trail.len() >= max {
                trail.pop_front();
            }
            trail.push_back(AuditRecord {
                entry_id: entry.entry_id,
                block_id: batch.block_id,
                block_number: batch.block_number,
                action: AuditAction::of(entry),
                address: entry.address.clone(),
                amount: entry.amount,
                timestamp: entry.timestamp,
                reconciled: false,
            });
        }

        if batch.block_number % PROGRESS_INTERVAL == 0 {
            info!(
                "Audit log at block #{}: {} audit records",
                batch.block_number,
                trail.len()
            );
        }
        large
    }
}

#[async_trait]
impl EventProcessor for LedgerAuditor {
    type Event = LedgerBatchEvent;
    type Key = i64;

    fn name(&self) -> &'static str {
        "ledger_audit"
    }

    fn key(&self, batch: &LedgerBatchEvent) -> i64 {
        batch.block_id
    }

    async fn is_processed(&self, key: &i64) -> bool {
        self.processed.contains(key)
    }

    async fn process(&self, batch: &LedgerBatchEvent) -> Result<Outcome> {
        if !self.processed.insert(batch.block_id) {
            return Ok(Outcome::Skipped);
        }
        self.audit(batch);
        Ok(Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(id: i64, tx_id: Option<i64>, amount: Decimal) -> LedgerEntryEvent {
        LedgerEntryEvent {
            entry_id: id,
            tx_id,
            block_id: 1,
            block_number: 100,
            address: "A".into(),
            amount,
            balance_after: amount,
            entry_type: "TRANSFER".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    fn batch(block_id: i64, entries: Vec<LedgerEntryEvent>) -> LedgerBatchEvent {
        LedgerBatchEvent {
            block_id,
            block_number: 100,
            total_entries: entries.len(),
            entries,
            timestamp: 1_700_000_000,
            miner_address: "M".into(),
        }
    }

    #[test]
    fn test_action_classification() {
        assert_eq!(AuditAction::of(&entry(1, None, dec!(50))), AuditAction::Reward);
        assert_eq!(AuditAction::of(&entry(2, Some(9), dec!(5))), AuditAction::Credit);
        assert_eq!(AuditAction::of(&entry(3, Some(9), dec!(-5))), AuditAction::Debit);
        assert_eq!(AuditAction::of(&entry(4, Some(9), dec!(0))), AuditAction::Debit);
    }

    #[test]
    fn test_large_amounts_flagged() {
        let auditor = LedgerAuditor::new(LedgerAuditConfig::default());
        let large = auditor.audit(&batch(
            1,
            vec![
                entry(1, Some(1), dec!(1000)),
                entry(2, Some(2), dec!(-1000.01)),
                entry(3, Some(3), dec!(2500)),
            ],
        ));
        assert_eq!(large, 2);
        assert_eq!(auditor.len(), 3);
    }

    #[tokio::test]
    async fn test_trail_bounded_and_deduplicated() {
        let auditor = LedgerAuditor::new(LedgerAuditConfig {
            max_records: 3,
            ..Default::default()
        });
        let first = batch(1, vec![entry(1, None, dec!(1)), entry(2, None, dec!(1))]);
        auditor.process(&first).await.unwrap();
        auditor.process(&first).await.unwrap();
        assert_eq!(auditor.len(), 2);

        auditor
            .process(&batch(2, vec![entry(3, None, dec!(1)), entry(4, None, dec!(1))]))
            .await
            .unwrap();
        let ids: Vec<i64> = auditor.audit_trail(10).iter().map(|r| r.entry_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(auditor.audit_trail(1)[0].entry_id, 4);
    }

    #[test]
    fn test_action_wire_format() {
        let encoded = serde_json::to_value(AuditAction::Reward).unwrap();
        assert_eq!(encoded, "REWARD");
    }
}
