//! Property tests for the reward formula

use ledger_core::RewardCalculationEvent;
use proptest::prelude::*;
use rust_decimal::Decimal;
use settlement::reward_calculation::{bonus_percent, calculate_breakdown, MAX_BONUS_PERCENT};

fn event(tx_count: i64, fee_cents: i64, reward_cents: i64, miner: &str) -> RewardCalculationEvent {
    RewardCalculationEvent {
        block_id: 1,
        block_number: 1,
        miner_address: miner.into(),
        block_reward: Decimal::new(reward_cents, 2),
        transaction_count: tx_count,
        total_transaction_fee: Decimal::new(fee_cents, 2),
        market_price: Decimal::ONE,
        timestamp: 0,
    }
}

proptest! {
    #[test]
    fn bonus_is_bounded(tx in 0i64..10_000, fee in 0i64..1_000_000) {
        let percent = bonus_percent(&event(tx, fee, 5_000, "miner"));
        prop_assert!(percent >= Decimal::ZERO);
        prop_assert!(percent <= MAX_BONUS_PERCENT);
    }

    #[test]
    fn bonus_grows_with_transactions(tx in 0i64..1_000, extra in 0i64..1_000, fee in 0i64..10_000) {
        let fewer = bonus_percent(&event(tx, fee, 5_000, "miner"));
        let more = bonus_percent(&event(tx + extra, fee, 5_000, "miner"));
        prop_assert!(more >= fewer);
    }

    #[test]
    fn no_bonus_below_ten_transactions_without_fees(tx in 0i64..10) {
        prop_assert_eq!(bonus_percent(&event(tx, 0, 5_000, "miner")), Decimal::ZERO);
    }

    #[test]
    fn total_is_sum_of_parts(
        tx in 0i64..500,
        fee in 0i64..100_000,
        reward in 0i64..1_000_000,
    ) {
        let breakdown = calculate_breakdown(&event(tx, fee, reward, "miner"));
        prop_assert_eq!(
            breakdown.total_reward,
            breakdown.block_reward + breakdown.transaction_fees + breakdown.bonus_reward
        );
        prop_assert!(breakdown.bonus_reward <= breakdown.block_reward / Decimal::TEN);
        prop_assert!(breakdown.total_reward >= Decimal::ZERO);
    }
}
