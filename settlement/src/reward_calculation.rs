//! Reward calculation engine
//!
//! Turns a per-block reward basis into a distribution event:
//!
//! - transaction bonus: `min(tx_count / 10, 5)` percent, only from 10
//!   transactions up
//! - active-miner bonus: 0.5 percent when the block has a miner and earned
//!   fees
//! - total bonus capped at 10 percent of the block reward
//!
//! `total = block_reward + fees + bonus` and `usd = total * market_price`.
//! A negative total or USD value fails the event into the retry store; it
//! is never clamped. Each block ID is processed once per idempotency TTL.

use crate::consumer::{EventProcessor, Outcome};
use crate::idempotency::IdempotencyStore;
use crate::topology::KEY_REWARD_DISTRIBUTION;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ledger_core::emission;
use ledger_core::{RewardBreakdown, RewardCalculationEvent, RewardDistributionEvent};
use message_bus::Publisher;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Publish deadline for the distribution event
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failed block is remembered for the retried count
pub const FAILED_BLOCK_RETENTION: Duration = Duration::from_secs(3_600);

/// Cap on the transaction bonus, in percent
pub const MAX_TX_BONUS_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Active-miner bonus, in percent
pub const ACTIVE_MINER_BONUS_PERCENT: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Cap on the total bonus, in percent
pub const MAX_BONUS_PERCENT: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

/// Bonus percentage earned by a block
pub fn bonus_percent(event: &RewardCalculationEvent) -> Decimal {
    let mut percent = Decimal::ZERO;

    if event.transaction_count >= 10 {
        let tx_bonus = Decimal::from(event.transaction_count) / Decimal::TEN;
        percent += tx_bonus.min(MAX_TX_BONUS_PERCENT);
    }

    if !event.miner_address.is_empty() && event.total_transaction_fee > Decimal::ZERO {
        percent += ACTIVE_MINER_BONUS_PERCENT;
    }

    percent.min(MAX_BONUS_PERCENT)
}

/// Reward components for a block
pub fn calculate_breakdown(event: &RewardCalculationEvent) -> RewardBreakdown {
    let bonus_reward = event.block_reward * bonus_percent(event) / Decimal::ONE_HUNDRED;
    let total_reward = event.block_reward + event.total_transaction_fee + bonus_reward;

    RewardBreakdown {
        block_reward: event.block_reward,
        transaction_fees: event.total_transaction_fee,
        bonus_reward,
        total_reward,
        estimated_usd_value: total_reward * event.market_price,
    }
}

/// Reject breakdowns that must not be paid out
pub fn validate_breakdown(block_number: i64, breakdown: &RewardBreakdown) -> Result<()> {
    if breakdown.total_reward < Decimal::ZERO {
        return Err(Error::InvariantViolation(format!(
            "negative total reward for block #{}: {}",
            block_number, breakdown.total_reward
        )));
    }
    if breakdown.estimated_usd_value < Decimal::ZERO {
        return Err(Error::InvariantViolation(format!(
            "negative USD value for block #{}: {}",
            block_number, breakdown.estimated_usd_value
        )));
    }
    Ok(())
}

/// Calculation counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalculationMetrics {
    /// Blocks calculated and published
    pub processed_count: u64,
    /// Failed attempts
    pub failed_count: u64,
    /// Attempts on blocks that had failed before
    pub retried_count: u64,
    /// Sum of published totals
    pub total_rewards_issued: Decimal,
    /// Sum of published USD values
    pub total_usd_value_issued: Decimal,
    /// `total_rewards_issued / processed_count`
    pub avg_reward_per_block: Decimal,
}

/// Reward calculation processor
pub struct RewardCalculator {
    publisher: Publisher,
    processed: Arc<dyn IdempotencyStore<i64>>,
    cleanup_interval: Duration,
    failed_blocks: DashMap<i64, Instant>,
    metrics: RwLock<CalculationMetrics>,
}

impl RewardCalculator {
    /// Create calculator publishing on `publisher`'s exchange
    pub fn new(
        publisher: Publisher,
        processed: Arc<dyn IdempotencyStore<i64>>,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            publisher,
            processed,
            cleanup_interval,
            failed_blocks: DashMap::new(),
            metrics: RwLock::new(CalculationMetrics::default()),
        }
    }

    /// Counter snapshot
    pub fn metrics(&self) -> CalculationMetrics {
        let mut snapshot = self.metrics.read().clone();
        if snapshot.processed_count > 0 {
            snapshot.avg_reward_per_block =
                snapshot.total_rewards_issued / Decimal::from(snapshot.processed_count);
        }
        snapshot
    }

    /// Failed blocks still remembered
    pub fn failed_block_count(&self) -> usize {
        self.failed_blocks.len()
    }

    /// Forget failed blocks older than [`FAILED_BLOCK_RETENTION`]
    pub fn purge_failed_blocks(&self) -> usize {
        let before = self.failed_blocks.len();
        self.failed_blocks
            .retain(|_, failed_at| failed_at.elapsed() < FAILED_BLOCK_RETENTION);
        before.saturating_sub(self.failed_blocks.len())
    }

    fn check_schedule(&self, event: &RewardCalculationEvent) {
        let scheduled = emission::block_reward(event.block_number);
        if event.block_reward != scheduled {
            warn!(
                "Block #{} reward {} differs from schedule {}",
                event.block_number, event.block_reward, scheduled
            );
        }
    }

    fn record_failure(&self, block_id: i64) {
        self.failed_blocks.insert(block_id, Instant::now());
        self.metrics.write().failed_count += 1;
    }

    fn record_success(&self, block_id: i64, breakdown: &RewardBreakdown) {
        self.failed_blocks.remove(&block_id);
        let mut metrics = self.metrics.write();
        metrics.processed_count += 1;
        metrics.total_rewards_issued += breakdown.total_reward;
        metrics.total_usd_value_issued += breakdown.estimated_usd_value;
    }

    async fn publish(&self, event: &RewardDistributionEvent) -> Result<()> {
        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            self.publisher.publish(KEY_REWARD_DISTRIBUTION, event),
        )
        .await
        .map_err(|_| Error::Timeout(PUBLISH_TIMEOUT.as_millis() as u64))??;
        Ok(())
    }
}

#[async_trait]
impl EventProcessor for RewardCalculator {
    type Event = RewardCalculationEvent;
    type Key = i64;

    fn name(&self) -> &'static str {
        "reward_calculation"
    }

    fn key(&self, event: &RewardCalculationEvent) -> i64 {
        event.block_id
    }

    async fn is_processed(&self, key: &i64) -> bool {
        self.processed.is_processed(key).await
    }

    async fn process(&self, event: &RewardCalculationEvent) -> Result<Outcome> {
        if self.failed_blocks.contains_key(&event.block_id) {
            self.metrics.write().retried_count += 1;
        }
        self.check_schedule(event);

        let breakdown = calculate_breakdown(event);
        if let Err(e) = validate_breakdown(event.block_number, &breakdown) {
            error!("❌ {}", e);
            self.record_failure(event.block_id);
            return Err(e);
        }

        let distribution = RewardDistributionEvent {
            block_id: event.block_id,
            block_number: event.block_number,
            miner_address: event.miner_address.clone(),
            miner_reward: breakdown.total_reward,
            miner_usd_value: breakdown.estimated_usd_value,
            reward_breakdown: breakdown.clone(),
            timestamp: Utc::now().timestamp(),
        };

        if let Err(e) = self.publish(&distribution).await {
            error!(
                "Failed to publish reward distribution for block #{}: {}",
                event.block_number, e
            );
            self.record_failure(event.block_id);
            return Err(e);
        }

        self.processed.mark_processed(event.block_id).await;
        self.record_success(event.block_id, &breakdown);

        info!(
            "Calculated reward for block #{}: {} ({} bonus) to {}",
            event.block_number, breakdown.total_reward, breakdown.bonus_reward, event.miner_address
        );
        Ok(Outcome::Applied)
    }

    fn maintenance_interval(&self) -> Option<Duration> {
        Some(self.cleanup_interval)
    }

    async fn maintain(&self) {
        let purged = self.processed.purge_expired().await;
        if purged > 0 {
            info!("Purged {} expired processed-block entries", purged);
        }
        let forgotten = self.purge_failed_blocks();
        if forgotten > 0 {
            info!("Forgot {} stale failed blocks", forgotten);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::TtlIdempotencyStore;
    use crate::topology::{declare_topology, EXCHANGE_REWARDS, QUEUE_REWARD_DISTRIBUTION};
    use message_bus::{BrokerClient, ClientConfig, MemoryBroker, PublisherConfig};
    use rust_decimal_macros::dec;

    fn basis(tx_count: i64, miner: &str, fee: Decimal) -> RewardCalculationEvent {
        RewardCalculationEvent {
            block_id: 1,
            block_number: 10,
            miner_address: miner.into(),
            block_reward: dec!(50),
            transaction_count: tx_count,
            total_transaction_fee: fee,
            market_price: dec!(1),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_reference_breakdown() {
        let breakdown = calculate_breakdown(&basis(20, "X", dec!(10)));
        assert_eq!(bonus_percent(&basis(20, "X", dec!(10))), dec!(2.5));
        assert_eq!(breakdown.bonus_reward, dec!(1.25));
        assert_eq!(breakdown.total_reward, dec!(61.25));
        assert_eq!(breakdown.estimated_usd_value, dec!(61.25));
    }

    #[test]
    fn test_bonus_rules() {
        // Below 10 transactions, no transaction bonus
        assert_eq!(bonus_percent(&basis(9, "", dec!(0))), dec!(0));
        assert_eq!(bonus_percent(&basis(10, "", dec!(0))), dec!(1));
        // Transaction bonus caps at 5
        assert_eq!(bonus_percent(&basis(500, "", dec!(0))), dec!(5));
        // Miner bonus needs both an address and fees
        assert_eq!(bonus_percent(&basis(0, "X", dec!(0))), dec!(0));
        assert_eq!(bonus_percent(&basis(0, "", dec!(3))), dec!(0));
        assert_eq!(bonus_percent(&basis(500, "X", dec!(3))), dec!(5.5));
    }

    #[test]
    fn test_negative_totals_are_rejected() {
        let mut event = basis(0, "X", dec!(-60));
        let breakdown = calculate_breakdown(&event);
        assert!(matches!(
            validate_breakdown(event.block_number, &breakdown),
            Err(Error::InvariantViolation(_))
        ));

        event.total_transaction_fee = dec!(0);
        event.market_price = dec!(-1);
        let breakdown = calculate_breakdown(&event);
        assert!(validate_breakdown(event.block_number, &breakdown).is_err());
    }

    async fn calculator(broker: &MemoryBroker) -> RewardCalculator {
        let client = BrokerClient::connect(Arc::new(broker.clone()), ClientConfig::default())
            .await
            .unwrap();
        declare_topology(&client).await.unwrap();
        RewardCalculator::new(
            Publisher::new(client, EXCHANGE_REWARDS, PublisherConfig::default()),
            Arc::new(TtlIdempotencyStore::new(Duration::from_secs(3600))),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_process_publishes_and_marks() {
        let broker = MemoryBroker::new();
        let calculator = calculator(&broker).await;

        let event = basis(20, "X", dec!(10));
        calculator.process(&event).await.unwrap();

        assert!(calculator.is_processed(&1).await);
        assert_eq!(broker.ready_count(QUEUE_REWARD_DISTRIBUTION), 1);
        let metrics = calculator.metrics();
        assert_eq!(metrics.processed_count, 1);
        assert_eq!(metrics.total_rewards_issued, dec!(61.25));
        assert_eq!(metrics.avg_reward_per_block, dec!(61.25));
    }

    #[tokio::test]
    async fn test_negative_total_fails_without_publishing() {
        let broker = MemoryBroker::new();
        let calculator = calculator(&broker).await;

        let event = basis(0, "X", dec!(-100));
        assert!(calculator.process(&event).await.is_err());
        assert!(calculator.process(&event).await.is_err());

        assert!(!calculator.is_processed(&1).await);
        assert_eq!(broker.ready_count(QUEUE_REWARD_DISTRIBUTION), 0);
        let metrics = calculator.metrics();
        assert_eq!(metrics.failed_count, 2);
        assert_eq!(metrics.retried_count, 1);
    }

    #[tokio::test]
    async fn test_stale_failed_blocks_are_purged() {
        let broker = MemoryBroker::new();
        let calculator = calculator(&broker).await;
        tokio::time::pause();

        let event = basis(0, "X", dec!(-100));
        assert!(calculator.process(&event).await.is_err());
        assert_eq!(calculator.failed_block_count(), 1);

        calculator.maintain().await;
        assert_eq!(calculator.failed_block_count(), 1);

        tokio::time::advance(FAILED_BLOCK_RETENTION + Duration::from_secs(1)).await;
        calculator.maintain().await;
        assert_eq!(calculator.failed_block_count(), 0);
    }
}
