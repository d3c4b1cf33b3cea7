//! Block reward emission schedule
//!
//! The base reward starts at 50 and halves every 100 blocks, never dropping
//! below 0.00000001.
//!
//! # Periods
//!
//! Supply is counted in periods of `HALVING_INTERVAL` blocks starting at
//! block 1 (blocks 1-100, 101-200, ...), each period paying the reward of
//! its first block.

use rust_decimal::Decimal;

/// Reward of the first period
pub const INITIAL_BLOCK_REWARD: Decimal = Decimal::from_parts(50, 0, 0, false, 0);

/// Blocks between halvings
pub const HALVING_INTERVAL: i64 = 100;

/// Reward floor
pub const MINIMUM_REWARD: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

/// Halvings counted by [`max_supply`]
pub const MAX_HALVINGS: u32 = 20;

/// Base reward for `block_number`
pub fn block_reward(block_number: i64) -> Decimal {
    let halvings = block_number.max(0) / HALVING_INTERVAL;
    halved(halvings)
}

fn halved(halvings: i64) -> Decimal {
    let two = Decimal::from(2);
    let mut reward = INITIAL_BLOCK_REWARD;
    for _ in 0..halvings {
        reward /= two;
        if reward < MINIMUM_REWARD {
            return MINIMUM_REWARD;
        }
    }
    reward
}

/// Coins minted by blocks `1..=block_number`
pub fn current_supply(block_number: i64) -> Decimal {
    let mut supply = Decimal::ZERO;
    let mut current = 1;

    while current <= block_number {
        let period_end = ((current - 1) / HALVING_INTERVAL + 1) * HALVING_INTERVAL;
        let end = period_end.min(block_number);
        let blocks = Decimal::from(end - current + 1);
        supply += blocks * block_reward(current);
        current = end + 1;
    }

    supply
}

/// Supply after [`MAX_HALVINGS`] full periods
pub fn max_supply() -> Decimal {
    let interval = Decimal::from(HALVING_INTERVAL);
    (0..MAX_HALVINGS as i64)
        .map(|i| interval * halved(i))
        .sum()
}

/// First block of the next halving period
pub fn next_halving_block(current_block: i64) -> i64 {
    (current_block / HALVING_INTERVAL + 1) * HALVING_INTERVAL
}

/// Blocks remaining until [`next_halving_block`]
pub fn blocks_until_halving(current_block: i64) -> i64 {
    next_halving_block(current_block) - current_block
}

/// Whether `block_number` starts a halving
pub fn is_halving_block(block_number: i64) -> bool {
    block_number > 0 && block_number % HALVING_INTERVAL == 0
}
