//! Wire events exchanged over the message bus
//!
//! All events are JSON with snake_case field names; amounts and prices are
//! JSON numbers and timestamps are unix seconds.

use crate::types::{Address, LedgerEntry};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-block reward basis, published once per mined block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardCalculationEvent {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Miner address (may be empty)
    pub miner_address: Address,
    /// Base block reward
    pub block_reward: Decimal,
    /// Transactions included in the block
    pub transaction_count: i64,
    /// Sum of transaction fees
    pub total_transaction_fee: Decimal,
    /// Market price at the time of the block
    pub market_price: Decimal,
    /// Block time
    pub timestamp: i64,
}

/// Reward components; only ever carried inside a distribution event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    /// Base block reward
    pub block_reward: Decimal,
    /// Transaction fees
    pub transaction_fees: Decimal,
    /// Bonus on top of the base reward
    pub bonus_reward: Decimal,
    /// `block_reward + transaction_fees + bonus_reward`
    pub total_reward: Decimal,
    /// `total_reward * market_price`
    pub estimated_usd_value: Decimal,
}

/// Drives exactly one wallet credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDistributionEvent {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Credited miner
    pub miner_address: Address,
    /// Amount to credit
    pub miner_reward: Decimal,
    /// Estimated USD value of the credit
    pub miner_usd_value: Decimal,
    /// Components
    pub reward_breakdown: RewardBreakdown,
    /// Calculation time
    pub timestamp: i64,
}

impl RewardDistributionEvent {
    /// `blockNumber_minerAddress`
    pub fn idempotency_key(&self) -> String {
        format!("{}_{}", self.block_number, self.miner_address)
    }
}

/// One ledger row as published with its block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryEvent {
    /// Entry ID
    pub entry_id: i64,
    /// Transaction ID; null for reward entries
    pub tx_id: Option<i64>,
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Affected address
    pub address: Address,
    /// Signed amount
    pub amount: Decimal,
    /// Balance after the entry
    pub balance_after: Decimal,
    /// Entry type
    pub entry_type: String,
    /// Entry time
    pub timestamp: i64,
}

impl LedgerEntryEvent {
    /// Convert into a storable entry
    pub fn to_entry(&self) -> LedgerEntry {
        LedgerEntry {
            id: self.entry_id,
            tx_id: self.tx_id,
            block_id: self.block_id,
            block_number: self.block_number,
            address: self.address.clone(),
            amount: self.amount,
            balance_after: self.balance_after,
            entry_type: self.entry_type.clone(),
            created_at: unix_to_datetime(self.timestamp),
        }
    }
}

impl From<&LedgerEntry> for LedgerEntryEvent {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            entry_id: entry.id,
            tx_id: entry.tx_id,
            block_id: entry.block_id,
            block_number: entry.block_number,
            address: entry.address.clone(),
            amount: entry.amount,
            balance_after: entry.balance_after,
            entry_type: entry.entry_type.clone(),
            timestamp: entry.created_at.timestamp(),
        }
    }
}

/// All ledger rows produced by one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBatchEvent {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Number of entries
    pub total_entries: usize,
    /// Entries
    pub entries: Vec<LedgerEntryEvent>,
    /// Block time
    pub timestamp: i64,
    /// Miner address
    pub miner_address: Address,
}

/// Market snapshot after a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPricingEvent {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// Price after the block
    pub price: Decimal,
    /// Pool liquidity
    pub liquidity: Decimal,
    /// Buy volume
    pub buy_volume: Decimal,
    /// Sell volume
    pub sell_volume: Decimal,
    /// Transactions in the block
    pub tx_count: i64,
    /// Block time
    pub timestamp: i64,
    /// Miner address
    pub miner_address: Address,
}

/// Per-block volume figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketVolumeUpdate {
    /// Block ID
    pub block_id: i64,
    /// Buy volume
    pub buy_volume: Decimal,
    /// Sell volume
    pub sell_volume: Decimal,
    /// `buy - sell`
    pub net_volume: Decimal,
    /// `buy / sell` (0 when there were no sells)
    pub volume_ratio: Decimal,
    /// Transactions in the block
    pub tx_count: i64,
    /// Block time
    pub timestamp: i64,
}

/// Live price change pushed to the broadcast sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Block ID
    pub block_id: i64,
    /// Block number
    pub block_number: i64,
    /// New price
    pub price: Decimal,
    /// `price - previous`
    pub price_change: Decimal,
    /// `price_change / previous * 100`
    pub price_change_percent: Decimal,
    /// Pool liquidity
    pub liquidity: Decimal,
    /// Buy volume
    pub buy_volume: Decimal,
    /// Sell volume
    pub sell_volume: Decimal,
    /// Transactions in the block
    pub tx_count: i64,
    /// Block time
    pub timestamp: i64,
    /// Miner address
    pub miner_address: Address,
}

/// Unix seconds to UTC, clamping out-of-range values to the epoch
pub fn unix_to_datetime(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reward_calculation_event_from_json() {
        let json = r#"{
            "block_id": 42,
            "block_number": 120,
            "miner_address": "X",
            "block_reward": 25,
            "transaction_count": 20,
            "total_transaction_fee": 10.5,
            "market_price": 1.25,
            "timestamp": 1700000000
        }"#;
        let event: RewardCalculationEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.block_reward, dec!(25));
        assert_eq!(event.total_transaction_fee, dec!(10.5));
        assert_eq!(event.miner_address.as_str(), "X");
    }

    #[test]
    fn test_distribution_idempotency_key() {
        let event = RewardDistributionEvent {
            block_id: 1,
            block_number: 77,
            miner_address: "miner-1".into(),
            miner_reward: dec!(61.25),
            miner_usd_value: dec!(61.25),
            reward_breakdown: RewardBreakdown {
                block_reward: dec!(50),
                transaction_fees: dec!(10),
                bonus_reward: dec!(1.25),
                total_reward: dec!(61.25),
                estimated_usd_value: dec!(61.25),
            },
            timestamp: 0,
        };
        assert_eq!(event.idempotency_key(), "77_miner-1");
    }

    #[test]
    fn test_ledger_entry_null_tx_is_reward() {
        let json = r#"{
            "entry_id": 5, "tx_id": null, "block_id": 3, "block_number": 50,
            "address": "A", "amount": 50, "balance_after": 150,
            "entry_type": "REWARD", "timestamp": 1700000000
        }"#;
        let event: LedgerEntryEvent = serde_json::from_str(json).unwrap();
        let entry = event.to_entry();
        assert!(entry.is_reward());
        assert_eq!(entry.balance_after, dec!(150));
        assert_eq!(entry.created_at.timestamp(), 1_700_000_000);
        assert_eq!(LedgerEntryEvent::from(&entry), event);
    }
}
