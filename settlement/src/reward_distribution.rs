//! Reward distribution engine
//!
//! Credits each distribution event to the miner's wallet exactly once per
//! idempotency TTL. The credit runs in one wallet transaction: lock or
//! create the wallet, update the balance, append a `MINING` history row,
//! commit. Any failing step rolls back and the event goes to the retry
//! store.
//!
//! The idempotency key is `blockNumber_minerAddress`. Entries expire after
//! the TTL (24h by default), after which a redelivered event would be paid
//! again.

use crate::consumer::{EventProcessor, Outcome};
use crate::idempotency::IdempotencyStore;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use ledger_core::{
    Address, ChangeType, RewardDistributionEvent, WalletHistory, WalletStore, WalletTx,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-miner totals, kept in memory only
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RewardStats {
    /// Miner
    pub miner_address: Address,
    /// Sum of credited rewards
    pub total_rewards: Decimal,
    /// Sum of USD values
    pub total_usd_value: Decimal,
    /// Credits applied
    pub reward_count: u64,
    /// Timestamp of the last credited event
    pub last_reward_at: i64,
    /// Block number of the last credit
    pub last_block_number: i64,
}

/// Removes an in-flight key when dropped
struct Claim<'a> {
    in_flight: &'a DashSet<String>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Reward distribution processor
pub struct RewardDistributor {
    wallets: Arc<dyn WalletStore>,
    processed: Arc<dyn IdempotencyStore<String>>,
    cleanup_interval: Duration,
    in_flight: DashSet<String>,
    stats: RwLock<HashMap<Address, RewardStats>>,
}

impl RewardDistributor {
    /// Create distributor
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        processed: Arc<dyn IdempotencyStore<String>>,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            wallets,
            processed,
            cleanup_interval,
            in_flight: DashSet::new(),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Totals for one miner
    pub fn stats(&self, miner: &Address) -> RewardStats {
        self.stats.read().get(miner).cloned().unwrap_or_else(|| RewardStats {
            miner_address: miner.clone(),
            ..Default::default()
        })
    }

    /// Totals for every miner
    pub fn all_stats(&self) -> HashMap<Address, RewardStats> {
        self.stats.read().clone()
    }

    fn claim(&self, key: &str) -> Option<Claim<'_>> {
        if self.in_flight.insert(key.to_string()) {
            Some(Claim {
                in_flight: &self.in_flight,
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Run the credit inside one transaction, returning balances before and after
    async fn credit(&self, event: &RewardDistributionEvent) -> Result<(Decimal, Decimal)> {
        let mut tx = self.wallets.begin_tx().await?;
        match apply_credit(tx.as_mut(), event).await {
            Ok(balances) => {
                tx.commit().await?;
                Ok(balances)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(
                        "Rollback failed for block #{}: {}",
                        event.block_number, rollback
                    );
                }
                Err(e)
            }
        }
    }

    fn update_stats(&self, event: &RewardDistributionEvent) {
        let mut stats = self.stats.write();
        let entry = stats
            .entry(event.miner_address.clone())
            .or_insert_with(|| RewardStats {
                miner_address: event.miner_address.clone(),
                ..Default::default()
            });
        entry.total_rewards += event.miner_reward;
        entry.total_usd_value += event.miner_usd_value;
        entry.reward_count += 1;
        entry.last_reward_at = event.timestamp;
        entry.last_block_number = event.block_number;
    }
}

async fn apply_credit(
    tx: &mut dyn WalletTx,
    event: &RewardDistributionEvent,
) -> Result<(Decimal, Decimal)> {
    let address = &event.miner_address;
    let wallet = match tx.get_for_update(address).await? {
        Some(wallet) => wallet,
        None => tx.upsert_empty(address).await?,
    };

    let before = wallet.balance;
    let after = before + event.miner_reward;
    tx.update_balance(address, after).await?;

    tx.insert_history(WalletHistory {
        id: Uuid::now_v7(),
        address: address.clone(),
        tx_id: None,
        change_type: ChangeType::Mining,
        amount: event.miner_reward,
        balance_before: before,
        balance_after: after,
        locked_before: wallet.locked_balance,
        locked_after: wallet.locked_balance,
        reference_id: Some(format!("BLOCK_{}", event.block_number)),
        description: Some(format!("Block reward for block #{}", event.block_number)),
        created_at: Utc::now(),
    })
    .await?;

    Ok((before, after))
}

#[async_trait]
impl EventProcessor for RewardDistributor {
    type Event = RewardDistributionEvent;
    type Key = String;

    fn name(&self) -> &'static str {
        "reward_distribution"
    }

    fn key(&self, event: &RewardDistributionEvent) -> String {
        event.idempotency_key()
    }

    async fn is_processed(&self, key: &String) -> bool {
        self.processed.is_processed(key).await
    }

    async fn process(&self, event: &RewardDistributionEvent) -> Result<Outcome> {
        if event.miner_address.is_empty() {
            warn!(
                "Block #{} has no miner address, nothing to distribute",
                event.block_number
            );
            return Ok(Outcome::Skipped);
        }
        if event.miner_reward < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "negative reward {} for block #{}",
                event.miner_reward, event.block_number
            )));
        }

        let key = event.idempotency_key();
        let Some(_claim) = self.claim(&key) else {
            info!("Reward {} is already being distributed, not crediting", key);
            return Ok(Outcome::Skipped);
        };
        if self.processed.is_processed(&key).await {
            debug!("Reward {} already distributed", key);
            return Ok(Outcome::Skipped);
        }

        let (before, after) = self.credit(event).await?;

        self.processed.mark_processed(key).await;
        self.update_stats(event);

        let breakdown = &event.reward_breakdown;
        info!(
            "✅ Distributed block #{} reward to {}: {} -> {} (+{}, ${}) [block={} fees={} bonus={}]",
            event.block_number,
            event.miner_address,
            before,
            after,
            event.miner_reward,
            event.miner_usd_value.round_dp(2),
            breakdown.block_reward,
            breakdown.transaction_fees,
            breakdown.bonus_reward
        );
        Ok(Outcome::Applied)
    }

    fn maintenance_interval(&self) -> Option<Duration> {
        Some(self.cleanup_interval)
    }

    async fn maintain(&self) {
        let purged = self.processed.purge_expired().await;
        if purged > 0 {
            info!("Purged {} expired processed-reward entries", purged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::TtlIdempotencyStore;
    use ledger_core::{FaultPoint, MemoryWalletStore, RewardBreakdown, Wallet};
    use rust_decimal_macros::dec;

    fn event(block_number: i64, miner: &str, reward: Decimal) -> RewardDistributionEvent {
        RewardDistributionEvent {
            block_id: block_number,
            block_number,
            miner_address: miner.into(),
            miner_reward: reward,
            miner_usd_value: reward,
            reward_breakdown: RewardBreakdown {
                block_reward: reward,
                transaction_fees: Decimal::ZERO,
                bonus_reward: Decimal::ZERO,
                total_reward: reward,
                estimated_usd_value: reward,
            },
            timestamp: 1_700_000_000 + block_number,
        }
    }

    fn distributor(store: &MemoryWalletStore, ttl: Duration) -> RewardDistributor {
        RewardDistributor::new(
            Arc::new(store.clone()),
            Arc::new(TtlIdempotencyStore::new(ttl)),
            Duration::from_secs(300),
        )
    }

    fn funded(store: &MemoryWalletStore, address: &str, balance: Decimal) {
        let mut wallet = Wallet::empty(address.into());
        wallet.balance = balance;
        store.insert(wallet);
    }

    #[tokio::test]
    async fn test_credit_writes_balance_and_one_history_row() {
        let store = MemoryWalletStore::new();
        funded(&store, "X", dec!(100));
        let distributor = distributor(&store, Duration::from_secs(86_400));

        distributor.process(&event(7, "X", dec!(61.25))).await.unwrap();

        let address = Address::new("X");
        assert_eq!(store.wallet(&address).unwrap().balance, dec!(161.25));
        let history = store.history(&address);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].balance_before, dec!(100));
        assert_eq!(history[0].balance_after, dec!(161.25));
        assert_eq!(history[0].change_type, ChangeType::Mining);
        assert_eq!(history[0].reference_id.as_deref(), Some("BLOCK_7"));
        assert_eq!(
            history[0].description.as_deref(),
            Some("Block reward for block #7")
        );
    }

    #[tokio::test]
    async fn test_duplicate_within_ttl_credits_once() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let reward = event(3, "X", dec!(50));

        assert_eq!(distributor.process(&reward).await.unwrap(), Outcome::Applied);
        assert!(distributor.is_processed(&reward.idempotency_key()).await);
        assert_eq!(distributor.process(&reward).await.unwrap(), Outcome::Skipped);

        let address = Address::new("X");
        assert_eq!(store.wallet(&address).unwrap().balance, dec!(50));
        assert_eq!(store.history(&address).len(), 1);
        assert_eq!(distributor.stats(&address).reward_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_credit_once() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let reward = event(4, "X", dec!(50));

        let (a, b) = tokio::join!(distributor.process(&reward), distributor.process(&reward));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == Outcome::Skipped);
        assert_eq!(outcomes, vec![Outcome::Applied, Outcome::Skipped]);
        assert_eq!(store.wallet(&"X".into()).unwrap().balance, dec!(50));
        assert_eq!(store.history_len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_reward_is_skipped_not_credited() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let reward = event(6, "X", dec!(50));

        let held = distributor.claim(&reward.idempotency_key());
        assert!(held.is_some());
        assert_eq!(distributor.process(&reward).await.unwrap(), Outcome::Skipped);
        assert!(store.wallet(&"X".into()).is_none());
        assert_eq!(distributor.stats(&"X".into()).reward_count, 0);
        assert!(!distributor.is_processed(&reward.idempotency_key()).await);

        drop(held);
        assert_eq!(distributor.process(&reward).await.unwrap(), Outcome::Applied);
        assert_eq!(store.wallet(&"X".into()).unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_missing_miner_is_skipped() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let outcome = distributor.process(&event(2, "", dec!(5))).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back() {
        let store = MemoryWalletStore::new();
        funded(&store, "X", dec!(10));
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let reward = event(5, "X", dec!(50));

        store.faults().arm(FaultPoint::InsertHistory, 1);
        let err = distributor.process(&reward).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.wallet(&"X".into()).unwrap().balance, dec!(10));
        assert_eq!(store.history_len(), 0);
        assert!(!distributor.is_processed(&reward.idempotency_key()).await);

        distributor.process(&reward).await.unwrap();
        assert_eq!(store.wallet(&"X".into()).unwrap().balance, dec!(60));
    }

    #[tokio::test]
    async fn test_creates_missing_wallet() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));

        distributor.process(&event(1, "new-miner", dec!(25))).await.unwrap();
        let wallet = store.wallet(&"new-miner".into()).unwrap();
        assert_eq!(wallet.balance, dec!(25));
        assert_eq!(wallet.total_received, dec!(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_ttl_is_paid_again() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let reward = event(9, "X", dec!(1));

        distributor.process(&reward).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_401)).await;
        assert!(!distributor.is_processed(&reward.idempotency_key()).await);

        distributor.process(&reward).await.unwrap();
        assert_eq!(store.wallet(&"X".into()).unwrap().balance, dec!(2));
    }

    #[tokio::test]
    async fn test_stats_accumulate_per_miner() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));

        distributor.process(&event(1, "A", dec!(10))).await.unwrap();
        distributor.process(&event(2, "A", dec!(5))).await.unwrap();
        distributor.process(&event(3, "B", dec!(1))).await.unwrap();

        let a = distributor.stats(&"A".into());
        assert_eq!(a.total_rewards, dec!(15));
        assert_eq!(a.reward_count, 2);
        assert_eq!(a.last_block_number, 2);
        assert_eq!(distributor.all_stats().len(), 2);
        assert_eq!(distributor.stats(&"nobody".into()).reward_count, 0);
    }

    #[tokio::test]
    async fn test_negative_reward_is_rejected() {
        let store = MemoryWalletStore::new();
        let distributor = distributor(&store, Duration::from_secs(86_400));
        let result = distributor.process(&event(1, "X", dec!(-1))).await;
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert!(store.wallet(&"X".into()).is_none());
    }
}
