//! Core types for the ledger
//!
//! All monetary amounts are `Decimal` so that credits, balances and
//! reconciliation comparisons are exact.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wallet address
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create new address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty address (no miner attributed)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// User wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owner address
    pub address: Address,

    /// Spendable plus locked balance
    pub balance: Decimal,

    /// Balance reserved by open orders
    pub locked_balance: Decimal,

    /// Lifetime credits
    pub total_received: Decimal,

    /// Lifetime debits
    pub total_sent: Decimal,

    /// Created at
    pub created_at: DateTime<Utc>,

    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Zero-balance wallet
    pub fn empty(address: Address) -> Self {
        let now = Utc::now();
        Self {
            address,
            balance: Decimal::ZERO,
            locked_balance: Decimal::ZERO,
            total_received: Decimal::ZERO,
            total_sent: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance not locked
    pub fn available(&self) -> Decimal {
        self.balance - self.locked_balance
    }
}

/// Kind of wallet mutation recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Block reward credit
    Mining,
    /// Transfer in or out
    Transfer,
    /// Transaction fee
    Fee,
    /// Funds locked
    Lock,
    /// Funds released
    Unlock,
}

impl ChangeType {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Mining => "MINING",
            ChangeType::Transfer => "TRANSFER",
            ChangeType::Fee => "FEE",
            ChangeType::Lock => "LOCK",
            ChangeType::Unlock => "UNLOCK",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row written in the same transaction as a wallet mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletHistory {
    /// Row ID
    pub id: Uuid,

    /// Wallet address
    pub address: Address,

    /// Originating transaction, if any
    pub tx_id: Option<i64>,

    /// Mutation kind
    pub change_type: ChangeType,

    /// Signed amount
    pub amount: Decimal,

    /// Balance before
    pub balance_before: Decimal,

    /// Balance after
    pub balance_after: Decimal,

    /// Locked balance before
    pub locked_before: Decimal,

    /// Locked balance after
    pub locked_after: Decimal,

    /// External reference (e.g. `BLOCK_42`)
    pub reference_id: Option<String>,

    /// Human-readable description
    pub description: Option<String>,

    /// Created at
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID
    pub id: i64,

    /// Transaction ID; `None` marks a block reward entry
    pub tx_id: Option<i64>,

    /// Block ID
    pub block_id: i64,

    /// Block number
    pub block_number: i64,

    /// Affected address
    pub address: Address,

    /// Signed amount
    pub amount: Decimal,

    /// Balance of `address` after this entry
    pub balance_after: Decimal,

    /// Entry type (e.g. `REWARD`, `TRANSFER`)
    pub entry_type: String,

    /// Created at
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Reward entries carry no transaction
    pub fn is_reward(&self) -> bool {
        self.tx_id.is_none()
    }
}

/// Mismatch between ledger-derived and live wallet balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceDiscrepancy {
    /// Store-assigned ID (0 until stored)
    pub id: i64,

    /// Wallet address
    pub address: Address,

    /// Checkpoint block number
    pub block_number: i64,

    /// Balance according to the ledger
    pub expected_balance: Decimal,

    /// Balance according to the wallet row
    pub actual_balance: Decimal,

    /// `actual - expected`
    pub difference: Decimal,

    /// Last ledger entry seen for the address
    pub last_entry_id: Option<i64>,

    /// Detected at
    pub timestamp: DateTime<Utc>,

    /// Resolved out of band
    pub resolved: bool,

    /// Resolution note
    pub resolution_note: Option<String>,

    /// Resolved at
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BalanceDiscrepancy {
    /// New unresolved discrepancy; `difference = actual - expected`
    pub fn new(
        address: Address,
        block_number: i64,
        expected_balance: Decimal,
        actual_balance: Decimal,
        last_entry_id: Option<i64>,
    ) -> Self {
        Self {
            id: 0,
            address,
            block_number,
            expected_balance,
            actual_balance,
            difference: actual_balance - expected_balance,
            last_entry_id,
            timestamp: Utc::now(),
            resolved: false,
            resolution_note: None,
            resolved_at: None,
        }
    }

    /// Same address, block and observed balances
    pub fn same_observation(&self, other: &BalanceDiscrepancy) -> bool {
        self.address == other.address
            && self.block_number == other.block_number
            && self.expected_balance == other.expected_balance
            && self.actual_balance == other.actual_balance
    }
}

/// Market state row, owned by block production
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    /// Current price
    pub price: Decimal,

    /// Pool liquidity
    pub liquidity: Decimal,

    /// Last block applied
    pub last_block: i64,

    /// Updated at
    pub updated_at: DateTime<Utc>,
}

/// Persisted per-block market tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    /// Tick ID
    pub id: i64,

    /// Block ID
    pub block_id: i64,

    /// Price after the block
    pub price: Decimal,

    /// Buy volume in the block
    pub buy_volume: Decimal,

    /// Sell volume in the block
    pub sell_volume: Decimal,

    /// Transactions in the block
    pub tx_count: i64,

    /// Created at
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_change_type_wire_format() {
        assert_eq!(serde_json::to_string(&ChangeType::Mining).unwrap(), "\"MINING\"");
        assert_eq!(ChangeType::Mining.to_string(), "MINING");
    }

    #[test]
    fn test_address_is_plain_string_on_wire() {
        let address = Address::new("0xabc");
        assert_eq!(serde_json::to_string(&address).unwrap(), "\"0xabc\"");
    }

    #[test]
    fn test_discrepancy_difference_is_actual_minus_expected() {
        let d = BalanceDiscrepancy::new("A".into(), 50, dec!(50), dec!(50.01), Some(9));
        assert_eq!(d.difference, dec!(0.01));
        assert!(!d.resolved);
    }

    #[test]
    fn test_same_observation_ignores_id_and_time() {
        let a = BalanceDiscrepancy::new("A".into(), 50, dec!(50), dec!(49), None);
        let mut b = a.clone();
        b.id = 7;
        b.timestamp = Utc::now();
        assert!(a.same_observation(&b));
        b.actual_balance = dec!(48);
        assert!(!a.same_observation(&b));
    }

    #[test]
    fn test_wallet_available() {
        let mut wallet = Wallet::empty("A".into());
        wallet.balance = dec!(10);
        wallet.locked_balance = dec!(2.5);
        assert_eq!(wallet.available(), dec!(7.5));
    }
}
