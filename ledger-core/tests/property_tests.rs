//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Emission: rewards halve monotonically and never drop below the floor
//! - Supply: minted supply grows with every block and stays under the cap
//! - Wallet transactions: history rows and balances commit together

use chrono::Utc;
use ledger_core::emission::{
    block_reward, blocks_until_halving, current_supply, is_halving_block, max_supply,
    next_halving_block, HALVING_INTERVAL, INITIAL_BLOCK_REWARD, MINIMUM_REWARD,
};
use ledger_core::{
    Address, ChangeType, FaultPoint, MemoryWalletStore, WalletHistory, WalletStore,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Strategy for generating credit amounts (positive, 8 decimal places)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000_000i64).prop_map(|units| Decimal::new(units, 8))
}

fn credit_row(address: &Address, before: Decimal, amount: Decimal) -> WalletHistory {
    WalletHistory {
        id: Uuid::now_v7(),
        address: address.clone(),
        tx_id: None,
        change_type: ChangeType::Mining,
        amount,
        balance_before: before,
        balance_after: before + amount,
        locked_before: Decimal::ZERO,
        locked_after: Decimal::ZERO,
        reference_id: None,
        description: None,
        created_at: Utc::now(),
    }
}

proptest! {
    /// Reward is always between the floor and the initial reward
    #[test]
    fn test_reward_bounds(block in 0i64..1_000_000) {
        let reward = block_reward(block);
        prop_assert!(reward >= MINIMUM_REWARD);
        prop_assert!(reward <= INITIAL_BLOCK_REWARD);
    }

    /// Reward never increases with block height
    #[test]
    fn test_reward_non_increasing(block in 0i64..100_000, step in 1i64..1_000) {
        prop_assert!(block_reward(block + step) <= block_reward(block));
    }

    /// Reward is constant within a halving period
    #[test]
    fn test_reward_constant_within_period(period in 0i64..30, offset in 0i64..HALVING_INTERVAL) {
        let start = period * HALVING_INTERVAL;
        prop_assert_eq!(block_reward(start + offset), block_reward(start));
    }

    /// Supply grows by exactly the block's reward
    #[test]
    fn test_supply_increments_by_reward(block in 1i64..2_000) {
        let delta = current_supply(block) - current_supply(block - 1);
        prop_assert_eq!(delta, block_reward(block));
    }

    /// Supply within the counted halvings stays under the cap
    #[test]
    fn test_supply_bounded(block in 0i64..2_000) {
        prop_assert!(current_supply(block) <= max_supply());
    }

    /// Next halving is always ahead and on an interval boundary
    #[test]
    fn test_next_halving_block(block in 0i64..1_000_000) {
        let next = next_halving_block(block);
        prop_assert!(next > block);
        prop_assert!(is_halving_block(next));
        prop_assert!(blocks_until_halving(block) <= HALVING_INTERVAL);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Committed credits sum to the final balance, one history row each
    #[test]
    fn test_committed_credits_conserve(
        amounts in prop::collection::vec(amount_strategy(), 1..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = MemoryWalletStore::new();
            let address = Address::new("miner");

            for amount in &amounts {
                let mut tx = store.begin_tx().await.unwrap();
                let wallet = tx.upsert_empty(&address).await.unwrap();
                tx.update_balance(&address, wallet.balance + *amount).await.unwrap();
                tx.insert_history(credit_row(&address, wallet.balance, *amount))
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
            }

            let total: Decimal = amounts.iter().copied().sum();
            let wallet = store.wallet(&address).unwrap();
            assert_eq!(wallet.balance, total);
            assert_eq!(wallet.total_received, total);
            assert_eq!(store.history(&address).len(), amounts.len());
        });
    }

    /// A failed commit leaves neither balance nor history behind
    #[test]
    fn test_failed_commit_is_atomic(amount in amount_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = MemoryWalletStore::new();
            let address = Address::new("miner");
            store.faults().arm(FaultPoint::Commit, 1);

            let mut tx = store.begin_tx().await.unwrap();
            tx.upsert_empty(&address).await.unwrap();
            tx.update_balance(&address, amount).await.unwrap();
            tx.insert_history(credit_row(&address, Decimal::ZERO, amount))
                .await
                .unwrap();
            assert!(tx.commit().await.is_err());

            assert!(store.wallet(&address).is_none());
            assert_eq!(store.history_len(), 0);
        });
    }
}
